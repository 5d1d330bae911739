//! HTTP mapping of engine errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use surge_core::{StreamingError, SurgeError};
use tracing::{error, warn};

/// Error returned by every handler.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Engine failure while serving the request
    #[error(transparent)]
    Surge(#[from] SurgeError),

    /// Request parameters missing or malformed
    #[error("Bad request: {reason}")]
    BadRequest {
        /// What was wrong with the request
        reason: String,
    },

    /// Segment file vanished between delivery and read
    #[error("Failed to read {path}: {reason}")]
    SegmentRead {
        /// Segment path
        path: String,
        /// Underlying I/O error
        reason: String,
    },
}

impl From<StreamingError> for ApiError {
    fn from(error: StreamingError) -> Self {
        ApiError::Surge(SurgeError::from(error))
    }
}

impl ApiError {
    /// Status code sent for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::SegmentRead { .. } => StatusCode::NOT_FOUND,
            ApiError::Surge(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            ApiError::Surge(e) if e.is_user_error() => StatusCode::BAD_REQUEST,
            ApiError::Surge(SurgeError::Streaming(StreamingError::Cancelled)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::Surge(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Body text shown to the client.
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Surge(e) => e.user_message(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected ({}): {}", status, self);
        }
        (status, self.user_message()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use surge_core::media::ProbeError;
    use surge_core::{EncodingError, TranscodingError};

    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (
                ApiError::from(StreamingError::Encoding(EncodingError::MissingMediaSource)),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(StreamingError::Probe(ProbeError::NotFound {
                    item_id: "x".to_string(),
                })),
                StatusCode::NOT_FOUND,
            ),
            (ApiError::from(StreamingError::Cancelled), StatusCode::SERVICE_UNAVAILABLE),
            (
                ApiError::from(StreamingError::SegmentNotProduced {
                    index: 3,
                    reason: "exited".to_string(),
                }),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(StreamingError::from(TranscodingError::StartFailed {
                    reason: "missing ffmpeg".to_string(),
                })),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(error.status_code(), status, "{error}");
        }
    }

    #[test]
    fn test_body_uses_user_message() {
        let error = ApiError::from(StreamingError::Probe(ProbeError::NotFound {
            item_id: "movie".to_string(),
        }));
        assert_eq!(error.user_message(), "Media item movie not found");

        let error = ApiError::from(StreamingError::from(TranscodingError::StartFailed {
            reason: "missing ffmpeg at /usr/bin/ffmpeg".to_string(),
        }));
        assert_eq!(error.user_message(), "Transcoder error occurred");
    }
}
