//! A single supervised transcoder run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::TranscodingError;
use super::process::ProcessCommand;
use super::progress::ProgressUpdate;
use crate::encoding::TranscodingJobType;

/// Lifecycle of a job. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Process launched, not yet confirmed running
    Starting,
    Running,
    Exited,
}

impl JobState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => JobState::Starting,
            1 => JobState::Running,
            _ => JobState::Exited,
        }
    }
}

/// Immutable description of a job, fixed at launch.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodingJobSpec {
    /// Output path: the playlist for HLS, the file for progressive
    pub path: PathBuf,
    pub job_type: TranscodingJobType,
    pub play_session_id: Option<String>,
    pub device_id: Option<String>,
    pub media_source_id: Option<String>,
    /// Segment length in seconds
    pub segment_length: u32,
    /// First segment index this run produces
    pub start_number: i64,
    /// Seek offset of this run
    pub start_time_ticks: i64,
    pub run_time_ticks: Option<i64>,
}

impl TranscodingJobSpec {
    pub fn new(path: impl Into<PathBuf>, job_type: TranscodingJobType) -> Self {
        Self {
            path: path.into(),
            job_type,
            play_session_id: None,
            device_id: None,
            media_source_id: None,
            segment_length: 6,
            start_number: 0,
            start_time_ticks: 0,
            run_time_ticks: None,
        }
    }
}

const UNKNOWN_POSITION: i64 = -1;

struct JobInner {
    id: Uuid,
    spec: TranscodingJobSpec,
    started_at: DateTime<Utc>,

    state: AtomicU8,
    exit_code: Mutex<Option<i32>>,
    active_requests: AtomicUsize,
    last_ping: Mutex<Instant>,
    is_paused: AtomicBool,

    transcoding_position_ticks: AtomicI64,
    download_position_ticks: AtomicI64,
    bytes_transcoded: AtomicU64,
    bytes_downloaded: AtomicU64,
    framerate: Mutex<Option<f32>>,
    bitrate: AtomicU64,

    commands: mpsc::UnboundedSender<ProcessCommand>,
    kill_requested: CancellationToken,
    exited: CancellationToken,
    shutdown: CancellationToken,
    kill_timer: Mutex<Option<CancellationToken>>,
}

/// Shared handle to a running or finished transcoder process.
///
/// Cloning is cheap; all clones observe the same state. Progress fields are
/// written by the stderr reader and segment delivery, and read by the
/// throttler and cleaner loops.
#[derive(Clone)]
pub struct TranscodingJob {
    inner: Arc<JobInner>,
}

impl std::fmt::Debug for TranscodingJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodingJob")
            .field("id", &self.inner.id)
            .field("path", &self.inner.spec.path)
            .field("state", &self.state())
            .finish()
    }
}

impl TranscodingJob {
    /// Creates a job and the receiving end of its standard-input command channel.
    pub fn new(spec: TranscodingJobSpec) -> (Self, mpsc::UnboundedReceiver<ProcessCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let job = Self {
            inner: Arc::new(JobInner {
                id: Uuid::new_v4(),
                spec,
                started_at: Utc::now(),
                state: AtomicU8::new(0),
                exit_code: Mutex::new(None),
                active_requests: AtomicUsize::new(0),
                last_ping: Mutex::new(Instant::now()),
                is_paused: AtomicBool::new(false),
                transcoding_position_ticks: AtomicI64::new(UNKNOWN_POSITION),
                download_position_ticks: AtomicI64::new(UNKNOWN_POSITION),
                bytes_transcoded: AtomicU64::new(0),
                bytes_downloaded: AtomicU64::new(0),
                framerate: Mutex::new(None),
                bitrate: AtomicU64::new(0),
                commands,
                kill_requested: CancellationToken::new(),
                exited: CancellationToken::new(),
                shutdown: CancellationToken::new(),
                kill_timer: Mutex::new(None),
            }),
        };
        (job, rx)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn spec(&self) -> &TranscodingJobSpec {
        &self.inner.spec
    }

    pub fn path(&self) -> &Path {
        &self.inner.spec.path
    }

    pub fn job_type(&self) -> TranscodingJobType {
        self.inner.spec.job_type
    }

    pub fn play_session_id(&self) -> Option<&str> {
        self.inner.spec.play_session_id.as_deref()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.inner.spec.device_id.as_deref()
    }

    pub fn segment_length(&self) -> u32 {
        self.inner.spec.segment_length
    }

    pub fn start_number(&self) -> i64 {
        self.inner.spec.start_number
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn is_same(&self, other: &TranscodingJob) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // State

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn has_exited(&self) -> bool {
        self.state() == JobState::Exited
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.inner.exit_code.lock()
    }

    /// Starting -> Running. No effect once exited.
    pub fn mark_running(&self) {
        let _ = self.inner.state.compare_exchange(
            0,
            1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Records the exit and wakes every task waiting on it.
    pub fn mark_exited(&self, exit_code: Option<i32>) {
        *self.inner.exit_code.lock() = exit_code;
        self.inner.state.store(2, Ordering::Release);
        self.inner.exited.cancel();
        debug!(
            "Job {} for {} exited with {:?}",
            self.inner.id,
            self.inner.spec.path.display(),
            exit_code
        );
    }

    /// Resolves once the process has exited.
    pub async fn wait_for_exit(&self) {
        self.inner.exited.cancelled().await;
    }

    /// Waits up to `timeout` for exit; returns whether the process exited.
    pub async fn wait_for_exit_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_for_exit())
            .await
            .is_ok()
    }

    // Control

    /// Sends a pause command unless already paused. Returns whether a byte was sent.
    pub fn pause(&self) -> bool {
        if self.has_exited() {
            return false;
        }
        if self
            .inner
            .is_paused
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.inner.commands.send(ProcessCommand::Pause).is_ok()
    }

    /// Sends a resume command unless running. Returns whether a byte was sent.
    pub fn resume(&self) -> bool {
        if self.has_exited() {
            return false;
        }
        if self
            .inner
            .is_paused
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.inner.commands.send(ProcessCommand::Resume).is_ok()
    }

    pub fn is_paused(&self) -> bool {
        self.inner.is_paused.load(Ordering::Acquire)
    }

    /// Asks the process to finish gracefully.
    ///
    /// # Errors
    /// - `TranscodingError::ControlFailed` - Standard input is no longer writable
    pub fn quit(&self) -> Result<(), TranscodingError> {
        self.inner
            .commands
            .send(ProcessCommand::Quit)
            .map_err(|_| TranscodingError::ControlFailed {
                reason: format!("stdin closed for {}", self.inner.spec.path.display()),
            })
    }

    /// Signals the exit watcher to force-terminate the process.
    pub fn request_kill(&self) {
        self.inner.kill_requested.cancel();
    }

    pub(crate) fn kill_requested_token(&self) -> CancellationToken {
        self.inner.kill_requested.clone()
    }

    /// Token cancelled when the job is disposed; stops its control loops.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    // Request tracking

    pub fn begin_request(&self) -> usize {
        self.inner.active_requests.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the active request count, never below zero.
    pub fn end_request(&self) -> usize {
        let mut current = self.inner.active_requests.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(1);
            match self.inner.active_requests.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn active_request_count(&self) -> usize {
        self.inner.active_requests.load(Ordering::Acquire)
    }

    pub fn ping(&self) {
        *self.inner.last_ping.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.last_ping.lock().elapsed()
    }

    /// Arms a new idle-kill timer, cancelling any previous one.
    pub fn replace_kill_timer(&self, timer: CancellationToken) {
        if let Some(previous) = self.inner.kill_timer.lock().replace(timer) {
            previous.cancel();
        }
    }

    pub fn cancel_kill_timer(&self) {
        if let Some(timer) = self.inner.kill_timer.lock().take() {
            timer.cancel();
        }
    }

    pub fn has_kill_timer(&self) -> bool {
        self.inner.kill_timer.lock().is_some()
    }

    /// Stops the control loops and any pending idle-kill timer.
    pub fn dispose(&self) {
        self.cancel_kill_timer();
        self.inner.shutdown.cancel();
    }

    // Progress

    /// Applies a stderr progress report. Positions are offset by the run's seek.
    pub fn report_progress(&self, update: &ProgressUpdate) {
        if let Some(position) = update.position_ticks {
            self.inner.transcoding_position_ticks.store(
                self.inner.spec.start_time_ticks + position,
                Ordering::Release,
            );
        }
        if let Some(bytes) = update.bytes_transcoded {
            self.inner.bytes_transcoded.store(bytes, Ordering::Release);
        }
        if let Some(bitrate) = update.bitrate {
            self.inner.bitrate.store(bitrate, Ordering::Release);
        }
        if let Some(framerate) = update.framerate {
            *self.inner.framerate.lock() = Some(framerate);
        }
    }

    pub fn transcoding_position_ticks(&self) -> Option<i64> {
        let value = self.inner.transcoding_position_ticks.load(Ordering::Acquire);
        (value >= 0).then_some(value)
    }

    pub fn download_position_ticks(&self) -> Option<i64> {
        let value = self.inner.download_position_ticks.load(Ordering::Acquire);
        (value >= 0).then_some(value)
    }

    pub fn set_download_position_ticks(&self, ticks: i64) {
        self.inner
            .download_position_ticks
            .store(ticks.max(0), Ordering::Release);
    }

    pub fn add_bytes_downloaded(&self, bytes: u64) {
        self.inner.bytes_downloaded.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.inner.bytes_downloaded.load(Ordering::Acquire)
    }

    pub fn bytes_transcoded(&self) -> u64 {
        self.inner.bytes_transcoded.load(Ordering::Acquire)
    }

    pub fn framerate(&self) -> Option<f32> {
        *self.inner.framerate.lock()
    }

    pub fn bitrate(&self) -> Option<u64> {
        let value = self.inner.bitrate.load(Ordering::Acquire);
        (value > 0).then_some(value)
    }
}
