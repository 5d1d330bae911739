//! Surge Core - On-demand HLS transcoding engine
//!
//! Negotiates encode plans from client constraints and probed source media,
//! supervises the external ffmpeg processes producing HLS output, and
//! delivers playlists and segments while those processes run.

pub mod config;
pub mod encoding;
pub mod keyframes;
pub mod media;
pub mod playlist;
pub mod streaming;
pub mod ticks;
pub mod tracing_setup;
pub mod transcoding;

// Re-export main types for convenient access
pub use config::SurgeConfig;
pub use encoding::{EncodingError, EncodingJobInfo};
pub use keyframes::{KeyframeCache, KeyframeError};
pub use media::{MediaSourceInfo, MediaSourceProvider, ProbeError};
pub use playlist::PlaylistError;
pub use streaming::{HlsService, StreamingError};
pub use transcoding::{TranscodeManager, TranscodingError};

/// Core errors that can bubble up from any Surge subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SurgeError {
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Keyframe error: {0}")]
    Keyframe(#[from] KeyframeError),

    #[error("Playlist error: {0}")]
    Playlist(#[from] PlaylistError),

    #[error("Transcoding error: {0}")]
    Transcoding(#[from] TranscodingError),

    #[error("Streaming error: {0}")]
    Streaming(StreamingError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StreamingError> for SurgeError {
    /// Unwraps subsystem errors the streaming layer only passed through.
    fn from(error: StreamingError) -> Self {
        match error {
            StreamingError::Encoding(e) => SurgeError::Encoding(e),
            StreamingError::Probe(e) => SurgeError::Probe(e),
            StreamingError::Playlist(e) => SurgeError::Playlist(e),
            StreamingError::Transcoding(e) => SurgeError::Transcoding(e),
            other => SurgeError::Streaming(other),
        }
    }
}

impl SurgeError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            SurgeError::Encoding(e) => format!("Cannot play this item as requested: {e}"),
            SurgeError::Probe(ProbeError::NotFound { item_id }) => {
                format!("Media item {item_id} not found")
            }
            SurgeError::Probe(_) | SurgeError::Keyframe(_) => {
                "Could not read media information".to_string()
            }
            SurgeError::Playlist(_) => "Playlist generation failed".to_string(),
            SurgeError::Transcoding(_) => "Transcoder error occurred".to_string(),
            SurgeError::Streaming(e) => match e {
                StreamingError::Cancelled => "Request cancelled".to_string(),
                StreamingError::SegmentNotProduced { index, .. } => {
                    format!("Segment {index} is not available")
                }
                StreamingError::UnknownRuntime { item_id } => {
                    format!("Duration of {item_id} is unknown")
                }
                StreamingError::InvalidSegment { reason } => format!("Invalid request: {reason}"),
                _ => "Streaming error occurred".to_string(),
            },
            SurgeError::Configuration { .. } => "Configuration error occurred".to_string(),
            SurgeError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Whether the requested item or segment does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SurgeError::Probe(ProbeError::NotFound { .. })
                | SurgeError::Streaming(StreamingError::SegmentNotProduced { .. })
        )
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        match self {
            SurgeError::Encoding(_) | SurgeError::Configuration { .. } => true,
            SurgeError::Probe(ProbeError::NotFound { .. }) => true,
            SurgeError::Streaming(e) => e.is_user_error(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SurgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_error_classification() {
        let error = SurgeError::from(EncodingError::MissingMediaSource);
        assert!(error.is_user_error());

        let error = SurgeError::from(StreamingError::Cancelled);
        assert!(!error.is_user_error());
        assert_eq!(error.user_message(), "Request cancelled");

        let error = SurgeError::from(ProbeError::NotFound {
            item_id: "movie.mkv".to_string(),
        });
        assert!(error.is_user_error());
        assert_eq!(error.user_message(), "Media item movie.mkv not found");

        let error = SurgeError::from(TranscodingError::StartFailed {
            reason: "no ffmpeg".to_string(),
        });
        assert!(!error.is_user_error());
    }

    #[test]
    fn test_streaming_errors_are_unwrapped() {
        let error = SurgeError::from(StreamingError::Probe(ProbeError::NotFound {
            item_id: "movie".to_string(),
        }));
        assert!(matches!(error, SurgeError::Probe(_)));
        assert!(error.is_not_found());
        assert_eq!(error.user_message(), "Media item movie not found");

        let error = SurgeError::from(StreamingError::from(EncodingError::MissingMediaSource));
        assert!(matches!(error, SurgeError::Encoding(_)));
        assert!(error.is_user_error());

        let error = SurgeError::from(StreamingError::InvalidSegment {
            reason: "no segment index in \"first.ts\"".to_string(),
        });
        assert!(error.is_user_error());
        assert!(!error.is_not_found());

        let error = SurgeError::from(StreamingError::SegmentNotProduced {
            index: 4,
            reason: "exited".to_string(),
        });
        assert!(error.is_not_found());
        assert_eq!(error.user_message(), "Segment 4 is not available");
    }
}
