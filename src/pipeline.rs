//! Shared per-request steps.
//!
//! Both transport surfaces (the streaming exchange and the HTTP endpoint)
//! run the same sequence once events are assembled: transform to the target
//! CRS, resolve the active route for every referenced id (skipping ids that
//! fail to load), and run the interpolation engine over the batch.

use std::sync::Arc;

use log::{info, warn};

use crate::error::{LrsError, Result};
use crate::events::Events;
use crate::geom::Geometry;
use crate::mvalue;
use crate::projection;
use crate::repo::Repository;
use crate::route::RouteBatch;

/// Run the M-value pipeline for a set of assembled events.
pub async fn process_events(
    repo: &Arc<Repository>,
    mut events: Events,
    target_crs: &str,
) -> Result<Events> {
    if events.is_materialized() && events.records().is_empty() {
        events = blocking(move || {
            events.load_to_buffer()?;
            Ok(events)
        })
        .await?;
    }

    if events.crs() != target_crs {
        let target = target_crs.to_string();
        events = blocking(move || {
            projection::transform(&events, &target, false)?.into_events()
        })
        .await?;
    }

    let route_ids = events.route_ids();
    if route_ids.is_empty() {
        return Err(LrsError::validation("no route ids found in events"));
    }
    info!("[Pipeline] {} unique route ids", route_ids.len());

    let mut batch = RouteBatch::new();
    for route_id in &route_ids {
        match repo.get_latest(route_id).await {
            Ok(route) => batch.add_route(route)?,
            Err(err) => {
                warn!(
                    "[Pipeline] failed to load route {}: {} (skipping)",
                    route_id, err
                );
            }
        }
    }
    if batch.is_empty() {
        return Err(LrsError::not_found(format!(
            "no catalog routes matched any of {} route ids",
            route_ids.len()
        )));
    }
    info!("[Pipeline] loaded {} routes into batch", batch.len());

    blocking(move || mvalue::calculate_m_values(&batch, &events)).await
}

async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => Err(LrsError::Cancelled),
        Err(err) => Err(LrsError::invariant(format!("blocking task failed: {}", err))),
    }
}
