//! Per-request stream state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::StreamingError;
use crate::config::HlsConfig;
use crate::encoding::EncodingJobInfo;
use crate::ticks::TICKS_PER_SECOND;
use crate::transcoding::TranscodingJobSpec;

/// Closes live streams a source had to open before it could be read.
#[async_trait]
pub trait LiveStreamHandle: Send + Sync {
    /// # Errors
    /// - `StreamingError::LiveStreamCloseFailed` - The stream could not be closed
    async fn close(&self, live_stream_id: &str) -> Result<(), StreamingError>;
}

/// One negotiated request: the encode plan plus where its output goes.
pub struct StreamState {
    pub job: EncodingJobInfo,
    /// Playlist the transcoder writes; segments sit next to it
    pub output_path: PathBuf,
    /// Segment length in seconds
    pub segment_length: u32,
    pub min_segments: u32,
    live_stream: Option<Arc<dyn LiveStreamHandle>>,
    disposed: bool,
}

impl std::fmt::Debug for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamState")
            .field("output_path", &self.output_path)
            .field("segment_length", &self.segment_length)
            .field("media_path", &self.job.media_path)
            .finish()
    }
}

impl StreamState {
    pub fn new(job: EncodingJobInfo, output_path: PathBuf, hls: &HlsConfig) -> Self {
        let segment_length = job
            .base_request
            .segment_length
            .filter(|length| *length > 0)
            .unwrap_or(hls.default_segment_length)
            .max(1);
        let min_segments = job
            .base_request
            .min_segments
            .unwrap_or(hls.default_min_segments);
        Self {
            job,
            output_path,
            segment_length,
            min_segments,
            live_stream: None,
            disposed: false,
        }
    }

    pub fn with_live_stream(mut self, handle: Arc<dyn LiveStreamHandle>) -> Self {
        self.live_stream = Some(handle);
        self
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn segment_length_ticks(&self) -> i64 {
        i64::from(self.segment_length) * TICKS_PER_SECOND
    }

    pub fn segment_extension(&self) -> &'static str {
        self.job.segment_extension()
    }

    pub fn run_time_ticks(&self) -> Option<i64> {
        self.job.run_time_ticks
    }

    pub fn device_id(&self) -> Option<&str> {
        self.job.base_request.device_id.as_deref()
    }

    pub fn play_session_id(&self) -> Option<&str> {
        self.job.base_request.play_session_id.as_deref()
    }

    /// Job description for a run starting at segment `start_number`.
    pub fn job_spec(&self, start_number: i64, start_time_ticks: i64) -> TranscodingJobSpec {
        TranscodingJobSpec {
            path: self.output_path.clone(),
            job_type: self.job.transcoding_type,
            play_session_id: self.job.base_request.play_session_id.clone(),
            device_id: self.job.base_request.device_id.clone(),
            media_source_id: self.job.base_request.media_source_id.clone(),
            segment_length: self.segment_length,
            start_number,
            start_time_ticks,
            run_time_ticks: self.job.run_time_ticks,
        }
    }

    /// Releases the live stream this request opened, if any. Safe to call twice.
    ///
    /// Streams the client opened itself (it sent a live stream id) stay open.
    pub async fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if self.job.base_request.live_stream_id.is_some() {
            return;
        }

        let live_stream_id = self
            .job
            .media_source
            .as_ref()
            .and_then(|source| source.live_stream_id.clone());
        if let (Some(handle), Some(id)) = (&self.live_stream, live_stream_id) {
            match handle.close(&id).await {
                Ok(()) => debug!("Closed live stream {}", id),
                Err(e) => warn!("Failed to close live stream {}: {}", id, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::encoding::{BaseEncodingJobOptions, TranscodingJobType};
    use crate::media::MediaSourceInfo;

    #[derive(Default)]
    struct CountingHandle {
        closed: AtomicUsize,
    }

    #[async_trait]
    impl LiveStreamHandle for CountingHandle {
        async fn close(&self, _live_stream_id: &str) -> Result<(), StreamingError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn job(segment_length: Option<u32>) -> EncodingJobInfo {
        let request = BaseEncodingJobOptions {
            segment_length,
            device_id: Some("dev".to_string()),
            ..Default::default()
        };
        EncodingJobInfo::new(request, TranscodingJobType::Hls)
    }

    #[test]
    fn test_segment_length_defaults() {
        let hls = HlsConfig::default();
        let state = StreamState::new(job(None), PathBuf::from("/t/a.m3u8"), &hls);
        assert_eq!(state.segment_length, 6);
        assert_eq!(state.segment_length_ticks(), 60_000_000);

        let state = StreamState::new(job(Some(3)), PathBuf::from("/t/a.m3u8"), &hls);
        assert_eq!(state.segment_length, 3);
        let spec = state.job_spec(4, 120_000_000);
        assert_eq!(spec.start_number, 4);
        assert_eq!(spec.device_id.as_deref(), Some("dev"));
        assert_eq!(spec.segment_length, 3);
    }

    #[tokio::test]
    async fn test_dispose_closes_live_stream_once() {
        let mut info = job(None);
        info.media_source = Some(MediaSourceInfo {
            live_stream_id: Some("live-1".to_string()),
            ..Default::default()
        });
        let handle = Arc::new(CountingHandle::default());
        let mut state = StreamState::new(info, PathBuf::from("/t/a.m3u8"), &HlsConfig::default())
            .with_live_stream(handle.clone());

        state.dispose().await;
        state.dispose().await;
        assert_eq!(handle.closed.load(Ordering::SeqCst), 1);
    }
}
