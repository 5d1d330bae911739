//! Surge Web - HLS HTTP API server

#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![deny(clippy::missing_panics_doc)]
//!
//! Thin axum handlers over [`surge_core::HlsService`]: playlists, segments,
//! session pings and active-encoding management.

pub mod error;
pub mod handlers;
pub mod server;

// Re-export main types
pub use error::ApiError;
pub use server::{AppState, build_router, run_server};
