//! Thin HTTP endpoint.
//!
//! `POST /calculate_m_value` accepts a GeoJSON FeatureCollection of point
//! events and returns the same collection with the interpolated M-value and
//! route distance added as properties. The CRS comes from the `crs` query
//! parameter, defaulting to WGS-84.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use log::info;
use serde::Deserialize;
use serde_json::json;

use crate::error::{LrsError, Result};
use crate::events::Events;
use crate::geom::WGS84;
use crate::pipeline;
use crate::repo::Repository;

/// Shared state for the HTTP handlers.
pub struct ApiState {
    pub repo: Arc<Repository>,
    pub target_crs: String,
}

#[derive(Debug, Deserialize)]
struct CrsQuery {
    crs: Option<String>,
}

/// Error wrapper translating error kinds into HTTP responses.
struct ApiError(LrsError);

impl From<LrsError> for ApiError {
    fn from(err: LrsError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LrsError::Validation { .. } => StatusCode::BAD_REQUEST,
            LrsError::NotFound { .. } => StatusCode::NOT_FOUND,
            LrsError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            LrsError::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            LrsError::Io { .. } | LrsError::Engine { .. } | LrsError::Invariant { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Build the API router.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/calculate_m_value", post(calculate_m_value))
        .with_state(state)
}

async fn calculate_m_value(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<CrsQuery>,
    body: Bytes,
) -> std::result::Result<Response, ApiError> {
    let crs = query.crs.unwrap_or_else(|| WGS84.to_string());
    let events = Events::from_feature_collection(&body, &crs)?;

    let result = pipeline::process_events(&state.repo, events, &state.target_crs).await?;
    let geojson = result.to_feature_collection()?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        geojson,
    )
        .into_response())
}

/// Serve the HTTP endpoint until the process exits.
pub async fn serve(state: Arc<ApiState>, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port)
        .parse()
        .map_err(|e| LrsError::validation(format!("invalid api bind address: {}", e)))?;

    info!("[Api] serving on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| LrsError::io(format!("failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, router(state))
        .await
        .map_err(|e| LrsError::io(format!("api server failed: {}", e)))
}
