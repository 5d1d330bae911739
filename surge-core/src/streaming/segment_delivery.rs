//! Segment-delivery state machine.
//!
//! Every segment request either finds its file on disk, attaches to the
//! transcode already producing it, or restarts the transcode at the
//! requested position. Restarts happen under the output path's lock so
//! concurrent requests never launch two processes for one path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::StreamingError;
use super::state::StreamState;
use crate::encoding::{CommandLineBuilder, HardwareCapabilities, Platform};
use crate::transcoding::files::{
    delete_stale_run, newest_segment_index, playlist_references_segment, segment_path,
};
use crate::transcoding::{StartRequest, TranscodeManager, TranscodingJob};

/// One segment request as carried on a media playlist URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentRequest {
    /// Segment index; `-1` is the fMP4 init segment
    pub index: i64,
    /// Start of the segment within the media
    pub runtime_ticks: Option<i64>,
    pub actual_segment_length_ticks: Option<i64>,
}

impl SegmentRequest {
    pub fn new(index: i64) -> Self {
        Self {
            index,
            runtime_ticks: None,
            actual_segment_length_ticks: None,
        }
    }
}

/// Marks a request as using a job until dropped.
pub struct RequestLease {
    manager: TranscodeManager,
    job: TranscodingJob,
}

impl RequestLease {
    fn begin(manager: &TranscodeManager, job: TranscodingJob) -> Self {
        job.begin_request();
        job.cancel_kill_timer();
        Self {
            manager: manager.clone(),
            job,
        }
    }

    pub fn job(&self) -> &TranscodingJob {
        &self.job
    }
}

impl Drop for RequestLease {
    fn drop(&mut self) {
        self.manager.on_transcode_end_request(&self.job);
    }
}

/// A segment ready to be sent. Holding it keeps the job's request count up.
pub struct SegmentResponse {
    pub path: PathBuf,
    pub index: i64,
    pub content_type: &'static str,
    lease: Option<RequestLease>,
}

impl std::fmt::Debug for SegmentResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentResponse")
            .field("path", &self.path)
            .field("index", &self.index)
            .finish()
    }
}

impl SegmentResponse {
    pub fn job(&self) -> Option<&TranscodingJob> {
        self.lease.as_ref().map(RequestLease::job)
    }
}

pub fn segment_content_type(extension: &str) -> &'static str {
    match extension {
        ".mp4" => "video/mp4",
        _ => "video/mp2t",
    }
}

/// Segments the client may skip ahead before a restart is cheaper than waiting.
pub fn restart_gap_segments(restart_gap_seconds: u32, segment_length: u32) -> i64 {
    i64::from(restart_gap_seconds.div_ceil(segment_length.max(1)))
}

/// Whether a request for `requested` must (re)start the transcode.
///
/// `current` is the index the live job is producing, `None` without a live job.
pub fn should_start_transcoding(requested: i64, current: Option<i64>, gap: i64) -> bool {
    if requested < 0 {
        return true;
    }
    match current {
        None => true,
        Some(current) => requested < current || requested - current > gap,
    }
}

/// Drives segment requests against the job supervisor.
#[derive(Clone)]
pub struct SegmentDelivery {
    manager: TranscodeManager,
    capabilities: Arc<HardwareCapabilities>,
    platform: Platform,
}

impl SegmentDelivery {
    pub fn new(
        manager: TranscodeManager,
        capabilities: Arc<HardwareCapabilities>,
        platform: Platform,
    ) -> Self {
        Self {
            manager,
            capabilities,
            platform,
        }
    }

    pub fn manager(&self) -> &TranscodeManager {
        &self.manager
    }

    /// Produces segment `request.index` of `state`, starting or restarting the
    /// transcode when needed.
    ///
    /// # Errors
    /// - `StreamingError::Cancelled` - `cancel` fired while waiting
    /// - `StreamingError::Transcoding` - The transcoder could not be started
    /// - `StreamingError::SegmentNotProduced` - The transcoder exited without writing it
    pub async fn get_segment(
        &self,
        state: &StreamState,
        request: &SegmentRequest,
        cancel: &CancellationToken,
    ) -> Result<SegmentResponse, StreamingError> {
        let playlist = state.output_path();
        let extension = state.segment_extension();
        let target = segment_path(playlist, request.index, extension);

        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            let lease = self.attach(state);
            return self.wait_for_segment(state, request, &target, lease, cancel).await;
        }

        let guard = self.manager.lock(playlist, cancel).await?;

        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            let lease = self.attach(state);
            drop(guard);
            return self.wait_for_segment(state, request, &target, lease, cancel).await;
        }

        let current = self.current_transcoding_index(state).await;
        let gap = restart_gap_segments(
            self.manager.supervisor_config().restart_gap_seconds,
            state.segment_length,
        );

        let lease = if should_start_transcoding(request.index, current, gap) {
            let start_index = request.index.max(0);
            debug!(
                "Starting transcode of {} at segment {} (current {:?})",
                playlist.display(),
                start_index,
                current
            );
            self.stop_existing_jobs(state).await;
            delete_stale_run(playlist, extension, start_index).await;

            let start_time_ticks = request
                .runtime_ticks
                .unwrap_or(start_index * state.segment_length_ticks());
            let job = self.start_transcoding(state, start_index, start_time_ticks).await?;
            Some(RequestLease::begin(&self.manager, job))
        } else {
            let lease = self.attach(state);
            if let Some(lease) = &lease {
                lease.job().resume();
            }
            lease
        };
        drop(guard);

        self.wait_for_segment(state, request, &target, lease, cancel).await
    }

    fn attach(&self, state: &StreamState) -> Option<RequestLease> {
        self.manager
            .on_transcode_begin_request(state.output_path(), state.job.transcoding_type)
            .map(|job| RequestLease {
                manager: self.manager.clone(),
                job,
            })
    }

    /// Index the live job is producing, derived from the newest file on disk.
    ///
    /// A job that has not written its first segment yet reports its start index.
    pub async fn current_transcoding_index(&self, state: &StreamState) -> Option<i64> {
        let job = self
            .manager
            .get_job_by_path(state.output_path(), state.job.transcoding_type)?;
        if job.has_exited() {
            return None;
        }
        let newest = newest_segment_index(state.output_path(), state.segment_extension()).await;
        Some(
            newest
                .filter(|index| *index >= job.start_number())
                .unwrap_or(job.start_number()),
        )
    }

    async fn stop_existing_jobs(&self, state: &StreamState) {
        let path = state.output_path().to_path_buf();
        let device = state.device_id().map(String::from);
        let session = state.play_session_id().map(String::from);
        let stopped = self
            .manager
            .kill_transcoding_jobs_where(
                |job| {
                    job.path() == path
                        || (device.is_some()
                            && job.device_id() == device.as_deref()
                            && session
                                .as_deref()
                                .is_none_or(|s| job.play_session_id() == Some(s)))
                },
                false,
            )
            .await;
        if stopped > 0 {
            debug!("Stopped {} jobs before restart of {}", stopped, path.display());
        }
    }

    async fn start_transcoding(
        &self,
        state: &StreamState,
        start_index: i64,
        start_time_ticks: i64,
    ) -> Result<TranscodingJob, StreamingError> {
        let mut job_info = state.job.clone();
        job_info.base_request.start_time_ticks = (start_time_ticks > 0).then_some(start_time_ticks);

        let args = CommandLineBuilder::new(
            &job_info,
            self.manager.encoding_options(),
            &self.capabilities,
            self.platform,
        )
        .hls_command_line(state.output_path(), state.segment_length, start_index);

        let job = self
            .manager
            .start_ffmpeg(StartRequest {
                spec: state.job_spec(start_index, start_time_ticks),
                args: args.into_vec(),
                segment_extension: Some(state.segment_extension().to_string()),
            })
            .await?;
        info!(
            "Transcode of {} started at segment {}",
            state.output_path().display(),
            start_index
        );
        Ok(job)
    }

    async fn is_segment_complete(
        &self,
        state: &StreamState,
        request: &SegmentRequest,
        target: &Path,
        job: Option<&TranscodingJob>,
    ) -> bool {
        if !tokio::fs::try_exists(target).await.unwrap_or(false) {
            return false;
        }
        let Some(job) = job else {
            return true;
        };
        if job.has_exited() {
            return true;
        }
        if playlist_references_segment(state.output_path(), target).await {
            return true;
        }
        let next = segment_path(state.output_path(), request.index + 1, state.segment_extension());
        tokio::fs::try_exists(&next).await.unwrap_or(false)
    }

    async fn wait_for_segment(
        &self,
        state: &StreamState,
        request: &SegmentRequest,
        target: &Path,
        lease: Option<RequestLease>,
        cancel: &CancellationToken,
    ) -> Result<SegmentResponse, StreamingError> {
        let poll_interval = self.manager.supervisor_config().segment_poll_interval;
        loop {
            let job = lease.as_ref().map(RequestLease::job);
            if self.is_segment_complete(state, request, target, job).await {
                return Ok(self.serve(state, request, target, lease).await);
            }

            if job.is_none_or(TranscodingJob::has_exited) {
                if tokio::fs::try_exists(target).await.unwrap_or(false) {
                    warn!("Serving {} after its transcoder exited", target.display());
                    return Ok(self.serve(state, request, target, lease).await);
                }
                let reason = match job {
                    Some(job) => format!("transcoder exited with {:?}", job.exit_code()),
                    None => "no transcoder is running".to_string(),
                };
                warn!("Cannot serve {}: {}", target.display(), reason);
                return Err(StreamingError::SegmentNotProduced {
                    index: request.index,
                    reason,
                });
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StreamingError::Cancelled),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    async fn serve(
        &self,
        state: &StreamState,
        request: &SegmentRequest,
        target: &Path,
        lease: Option<RequestLease>,
    ) -> SegmentResponse {
        if let Some(job) = lease.as_ref().map(RequestLease::job) {
            let end_ticks = match (request.runtime_ticks, request.actual_segment_length_ticks) {
                (Some(start), Some(length)) => start + length,
                _ => (request.index.max(0) + 1) * state.segment_length_ticks(),
            };
            job.set_download_position_ticks(end_ticks);
            if let Ok(metadata) = tokio::fs::metadata(target).await {
                job.add_bytes_downloaded(metadata.len());
            }
        }

        SegmentResponse {
            path: target.to_path_buf(),
            index: request.index,
            content_type: segment_content_type(state.segment_extension()),
            lease,
        }
    }
}
