//! Playlist and segment endpoints

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ApiError;
use crate::server::AppState;

/// Content type of master and media playlists.
pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

fn playlist_response(body: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// `GET /videos/{item_id}/master.m3u8`
///
/// # Errors
/// - `ApiError::Surge` - Item unknown or request not satisfiable
pub async fn master_playlist(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    let playlist = state
        .service
        .master_playlist(&item_id, query.as_deref().unwrap_or_default())
        .await?;
    Ok(playlist_response(playlist))
}

/// `GET /videos/{item_id}/main.m3u8`
///
/// # Errors
/// - `ApiError::Surge` - Item unknown, runtime unknown or request not satisfiable
pub async fn main_playlist(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    let playlist = state
        .service
        .main_playlist(&item_id, query.as_deref().unwrap_or_default())
        .await?;
    Ok(playlist_response(playlist))
}

/// `GET /videos/{item_id}/hls1/{playlist_id}/{segment}`
///
/// A client that disconnects drops this future, which cancels the wait
/// for the segment.
///
/// # Errors
/// - `ApiError::Surge` - Segment could not be produced
/// - `ApiError::SegmentRead` - Segment disappeared before it was read
pub async fn segment(
    State(state): State<AppState>,
    Path((item_id, playlist_id, segment_file)): Path<(String, String, String)>,
    RawQuery(query): RawQuery,
) -> Result<Response, ApiError> {
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    debug!("Segment {} of playlist {} for {}", segment_file, playlist_id, item_id);
    let response = state
        .service
        .segment(
            &item_id,
            &segment_file,
            query.as_deref().unwrap_or_default(),
            &cancel,
        )
        .await?;

    let data = tokio::fs::read(&response.path)
        .await
        .map_err(|e| ApiError::SegmentRead {
            path: response.path.display().to_string(),
            reason: e.to_string(),
        })?;
    let content_type = response.content_type;
    // Request count drops once the bytes are in hand
    drop(response);

    Ok((
        [(header::CONTENT_TYPE, content_type)],
        Body::from(Bytes::from(data)),
    )
        .into_response())
}
