//! Session keep-alive and transcode management endpoints

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use serde_json::json;
use surge_core::transcoding::ActiveEncodingInfo;
use tracing::info;

use crate::error::ApiError;
use crate::server::AppState;

/// Query of `POST /sessions/ping`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingQuery {
    /// Session whose transcode should stay alive
    pub play_session_id: Option<String>,
}

/// Query of `DELETE /videos/active-encodings`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopQuery {
    /// Device whose transcodes are stopped
    pub device_id: Option<String>,
    /// Restricts the stop to one session of the device
    pub play_session_id: Option<String>,
}

/// `POST /sessions/ping`
///
/// # Errors
/// - `ApiError::BadRequest` - No session id given
pub async fn ping(
    State(state): State<AppState>,
    Query(query): Query<PingQuery>,
) -> Result<StatusCode, ApiError> {
    let session = query
        .play_session_id
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest {
            reason: "playSessionId is required".to_string(),
        })?;
    if state.service.ping(&session) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Ok(StatusCode::NOT_FOUND)
    }
}

/// `DELETE /videos/active-encodings`
///
/// # Errors
/// - `ApiError::BadRequest` - No device id given
pub async fn stop_encodings(
    State(state): State<AppState>,
    Query(query): Query<StopQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let device_id = query
        .device_id
        .filter(|d| !d.is_empty())
        .ok_or_else(|| ApiError::BadRequest {
            reason: "deviceId is required".to_string(),
        })?;
    let session = query.play_session_id.filter(|s| !s.is_empty());

    let stopped = state.service.stop(&device_id, session.as_deref()).await;
    info!("Stopped {} transcodes for device {}", stopped, device_id);
    Ok(Json(json!({ "stopped": stopped })))
}

/// `GET /videos/active-encodings`
pub async fn active_encodings(State(state): State<AppState>) -> Json<Vec<ActiveEncodingInfo>> {
    Json(state.service.active_jobs())
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "active_encodings": state.service.manager().job_count(),
    }))
}
