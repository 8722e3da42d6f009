//! LRS server binary: environment loading, logging, and transport bootstrap.

use std::sync::Arc;

use log::{error, info, warn};

use lrs_server::api::{self, ApiState};
use lrs_server::{flight, Config, Repository, LAMBERT_WKT};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!("[Main] server failed: {}", err);
        std::process::exit(1);
    }
}

async fn run() -> lrs_server::Result<()> {
    let dotenv = dotenvy::dotenv();
    env_logger::init();
    if dotenv.is_err() {
        warn!("[Main] no .env file found, using process environment");
    }

    let config = Config::from_env();
    let repo = Arc::new(Repository::new(&config)?);

    let api_state = Arc::new(ApiState {
        repo: Arc::clone(&repo),
        target_crs: LAMBERT_WKT.to_string(),
    });
    let rest_port = config.rest_port;
    tokio::spawn(async move {
        if let Err(err) = api::serve(api_state, rest_port).await {
            error!("[Main] api server error: {}", err);
        }
    });

    info!(
        "[Main] starting flight server on port {} (spill threshold {} rows)",
        config.flight_port, config.spill_threshold
    );
    flight::serve(
        repo,
        config.flight_port,
        LAMBERT_WKT,
        config.spill_threshold,
    )
    .await
}
