//! HLS delivery.
//!
//! Ties negotiation, playlist generation and the job supervisor together:
//! a [`StreamState`] captures one negotiated request, [`SegmentDelivery`]
//! decides per segment request whether to reuse or (re)start a transcode,
//! and [`HlsService`] is the facade the HTTP layer calls.

pub mod segment_delivery;
pub mod service;
pub mod state;

pub use segment_delivery::{RequestLease, SegmentDelivery, SegmentRequest, SegmentResponse};
pub use service::HlsService;
pub use state::{LiveStreamHandle, StreamState};

use crate::encoding::EncodingError;
use crate::media::probe::ProbeError;
use crate::playlist::PlaylistError;
use crate::transcoding::TranscodingError;

/// Errors raised while serving playlists and segments.
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("Playlist error: {0}")]
    Playlist(#[from] PlaylistError),

    #[error("Transcoding error: {0}")]
    Transcoding(TranscodingError),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Segment {index} was not produced: {reason}")]
    SegmentNotProduced { index: i64, reason: String },

    #[error("Invalid segment request: {reason}")]
    InvalidSegment { reason: String },

    #[error("Runtime unknown for {item_id}")]
    UnknownRuntime { item_id: String },

    #[error("Failed to close live stream {live_stream_id}: {reason}")]
    LiveStreamCloseFailed {
        live_stream_id: String,
        reason: String,
    },
}

impl From<TranscodingError> for StreamingError {
    fn from(error: TranscodingError) -> Self {
        match error {
            TranscodingError::Cancelled => StreamingError::Cancelled,
            other => StreamingError::Transcoding(other),
        }
    }
}

impl StreamingError {
    /// Whether the request itself was at fault.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            StreamingError::Encoding(_)
                | StreamingError::InvalidSegment { .. }
                | StreamingError::Probe(ProbeError::NotFound { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_not_wrapped() {
        let error = StreamingError::from(TranscodingError::Cancelled);
        assert!(matches!(error, StreamingError::Cancelled));

        let error = StreamingError::from(TranscodingError::StartFailed {
            reason: "x".to_string(),
        });
        assert!(matches!(error, StreamingError::Transcoding(_)));
        assert!(!error.is_user_error());
    }

    #[test]
    fn test_user_errors() {
        let error = StreamingError::from(EncodingError::InvalidRequest {
            reason: "bad".to_string(),
        });
        assert!(error.is_user_error());
        let error = StreamingError::Probe(ProbeError::NotFound {
            item_id: "x".to_string(),
        });
        assert!(error.is_user_error());
    }
}
