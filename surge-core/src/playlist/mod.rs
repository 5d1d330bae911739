//! HLS playlist generation.
//!
//! The media ("main") playlist enumerates every segment of a VOD transcode up
//! front, either cut at source keyframes for stream copies or at fixed
//! intervals. The master playlist advertises the renditions a client may pick.

pub mod master_playlist;
pub mod media_playlist;

pub use master_playlist::{MasterPlaylistOptions, bitrate_variation, create_master_playlist};
pub use media_playlist::{
    compute_equal_length_segments, compute_segments_from_keyframes, create_main_playlist,
    is_extraction_allowed_for_file,
};

/// Errors raised while building playlists.
#[derive(Debug, thiserror::Error)]
pub enum PlaylistError {
    #[error("Invalid segment length: {reason}")]
    InvalidSegmentLength { reason: String },

    #[error("Keyframes extend past the media duration: {reason}")]
    KeyframesBeyondDuration { reason: String },
}

/// Everything needed to lay out one media playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateMainPlaylistRequest {
    /// Source file, consulted for the keyframe extension allow-list
    pub file_path: String,
    pub desired_segment_length_ms: i64,
    pub total_runtime_ticks: i64,
    /// `ts` or `mp4`
    pub segment_container: String,
    /// Prefix joined with the segment index, e.g. `hls1/main/`
    pub endpoint_prefix: String,
    /// Query string carried on every segment URL, with or without a leading `?`
    pub query_string: String,
    /// Whether the video is stream copied, which allows keyframe cuts
    pub is_remuxing_video: bool,
}
