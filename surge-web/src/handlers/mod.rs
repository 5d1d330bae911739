//! HTTP request handlers organized by functionality

pub mod hls;
pub mod sessions;

// Re-export handler functions
pub use hls::{PLAYLIST_CONTENT_TYPE, main_playlist, master_playlist, segment};
pub use sessions::{PingQuery, StopQuery, active_encodings, health, ping, stop_encodings};
