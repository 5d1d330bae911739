//! HLS web server for Surge
//!
//! Wires the engine into an axum router and runs it until Ctrl-C, then
//! stops every transcoder before returning.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::{get, post};
use surge_core::config::SurgeConfig;
use surge_core::encoding::{HardwareCapabilities, Platform};
use surge_core::media::ProbingMediaSourceProvider;
use surge_core::streaming::HlsService;
use surge_core::transcoding::TranscodeManager;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::handlers::{
    active_encodings, health, main_playlist, master_playlist, ping, segment, stop_encodings,
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Engine facade
    pub service: HlsService,
    /// When the server came up
    pub started_at: Instant,
}

impl AppState {
    /// State around an already assembled service.
    pub fn new(service: HlsService) -> Self {
        Self {
            service,
            started_at: Instant::now(),
        }
    }
}

/// Routes of the HLS API.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions/ping", post(ping))
        .route(
            "/videos/active-encodings",
            get(active_encodings).delete(stop_encodings),
        )
        .route("/videos/{item_id}/master.m3u8", get(master_playlist))
        .route("/videos/{item_id}/main.m3u8", get(main_playlist))
        .route(
            "/videos/{item_id}/hls1/{playlist_id}/{segment}",
            get(segment),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Runs the server on `config.server` until Ctrl-C.
///
/// # Errors
/// - `SurgeError::Io` - Listener could not be bound or the server failed
pub async fn run_server(config: SurgeConfig) -> surge_core::Result<()> {
    let capabilities = HardwareCapabilities::probe(&config.encoding.ffmpeg_path).await;
    info!(
        "ffmpeg at {} reports {} encoders, {} hwaccels",
        config.encoding.ffmpeg_path.display(),
        capabilities.encoders.len(),
        capabilities.hwaccels.len()
    );
    if capabilities.encoders.is_empty() {
        warn!("No encoders detected; transcodes will likely fail to start");
    }

    let provider = Arc::new(ProbingMediaSourceProvider::new(
        config.encoding.ffprobe_path.clone(),
        config.server.media_dir.clone(),
    ));
    let manager = TranscodeManager::with_ffmpeg(&config);
    let address = format!("{}:{}", config.server.host, config.server.port);
    let service = HlsService::new(
        config,
        provider,
        manager.clone(),
        capabilities,
        Platform::current(),
    );
    let app = build_router(AppState::new(service));

    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Surge HLS server running on http://{}", address);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await?;

    info!("Shutting down transcoders");
    manager.shutdown().await;
    Ok(())
}
