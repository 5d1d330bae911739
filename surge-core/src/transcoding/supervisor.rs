//! Transcoding job supervisor.
//!
//! [`TranscodeManager`] is the process-wide registry of live transcoder
//! processes. It launches them, tracks which requests are using them, kills
//! idle ones, and hands out the per-output-path locks that keep a path to a
//! single writer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cleaner::SegmentCleaner;
use super::files::delete_partial_stream_files;
use super::job::{JobState, TranscodingJob, TranscodingJobSpec};
use super::path_lock::{PathLockGuard, PathLocks};
use super::process::{FfmpegLauncher, ProcessLauncher, ProcessSpec, run_stdin_writer};
use super::progress::pump_stderr;
use super::throttler::Throttler;
use super::TranscodingError;
use crate::config::{EncodingOptions, SupervisorConfig, SurgeConfig};
use crate::encoding::TranscodingJobType;

/// Everything needed to launch one transcoder run.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub spec: TranscodingJobSpec,
    pub args: Vec<String>,
    /// Segment extension for HLS runs; enables the segment cleaner
    pub segment_extension: Option<String>,
}

/// Serializable snapshot of a registered job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveEncodingInfo {
    pub id: Uuid,
    pub path: PathBuf,
    pub job_type: TranscodingJobType,
    pub play_session_id: Option<String>,
    pub device_id: Option<String>,
    pub state: JobState,
    pub is_paused: bool,
    pub active_request_count: usize,
    pub transcoding_position_ticks: Option<i64>,
    pub download_position_ticks: Option<i64>,
    pub bytes_transcoded: u64,
    pub bytes_downloaded: u64,
    pub framerate: Option<f32>,
    pub bitrate: Option<u64>,
    pub started_at: DateTime<Utc>,
}

impl From<&TranscodingJob> for ActiveEncodingInfo {
    fn from(job: &TranscodingJob) -> Self {
        Self {
            id: job.id(),
            path: job.path().to_path_buf(),
            job_type: job.job_type(),
            play_session_id: job.play_session_id().map(String::from),
            device_id: job.device_id().map(String::from),
            state: job.state(),
            is_paused: job.is_paused(),
            active_request_count: job.active_request_count(),
            transcoding_position_ticks: job.transcoding_position_ticks(),
            download_position_ticks: job.download_position_ticks(),
            bytes_transcoded: job.bytes_transcoded(),
            bytes_downloaded: job.bytes_downloaded(),
            framerate: job.framerate(),
            bitrate: job.bitrate(),
            started_at: job.started_at(),
        }
    }
}

/// Per-job transcoder log next to the output.
pub fn log_path_for(output_path: &Path) -> PathBuf {
    let mut name = output_path.as_os_str().to_os_string();
    name.push(".log");
    PathBuf::from(name)
}

/// Process-wide job registry and lifecycle controller.
#[derive(Clone)]
pub struct TranscodeManager {
    options: Arc<EncodingOptions>,
    config: Arc<SupervisorConfig>,
    launcher: Arc<dyn ProcessLauncher>,
    jobs: Arc<RwLock<HashMap<PathBuf, TranscodingJob>>>,
    path_locks: PathLocks,
}

impl TranscodeManager {
    pub fn new(config: &SurgeConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            options: Arc::new(config.encoding.clone()),
            config: Arc::new(config.supervisor.clone()),
            launcher,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            path_locks: PathLocks::new(),
        }
    }

    /// Manager launching real ffmpeg processes.
    pub fn with_ffmpeg(config: &SurgeConfig) -> Self {
        Self::new(config, Arc::new(FfmpegLauncher))
    }

    pub fn encoding_options(&self) -> &EncodingOptions {
        &self.options
    }

    pub fn supervisor_config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Launches a transcoder and registers it under its output path.
    ///
    /// The job is only registered once the process is running.
    ///
    /// # Errors
    /// - `TranscodingError::Io` - Output directory could not be created
    /// - `TranscodingError::StartFailed` - Process could not be launched
    pub async fn start_ffmpeg(&self, request: StartRequest) -> Result<TranscodingJob, TranscodingError> {
        let StartRequest {
            spec,
            args,
            segment_extension,
        } = request;

        if let Some(dir) = spec.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| TranscodingError::Io {
                    path: dir.to_path_buf(),
                    reason: e.to_string(),
                })?;
        }

        let log_path = log_path_for(&spec.path);
        let process_spec = ProcessSpec {
            program: self.options.ffmpeg_path.clone(),
            args,
            working_dir: None,
        };
        info!(
            "Starting transcoder for {}: {} {}",
            spec.path.display(),
            process_spec.program.display(),
            process_spec.args.join(" ")
        );

        let (job, commands) = TranscodingJob::new(spec);
        let spawned = self.launcher.spawn(&process_spec).await.map_err(|e| {
            error!("Failed to start transcoder for {}: {}", job.path().display(), e);
            e
        })?;
        job.mark_running();

        if let Some(previous) = self
            .jobs
            .write()
            .insert(job.path().to_path_buf(), job.clone())
        {
            warn!(
                "Replaced registered job {} for {}",
                previous.id(),
                previous.path().display()
            );
            previous.dispose();
        }

        if let Some(stdin) = spawned.stdin {
            tokio::spawn(run_stdin_writer(
                stdin,
                commands,
                self.options.pause_key_supported,
            ));
        }

        if let Some(stderr) = spawned.stderr {
            let job = job.clone();
            tokio::spawn(async move { pump_stderr(stderr, Some(log_path.as_path()), job).await });
        }

        {
            let manager = self.clone();
            let job = job.clone();
            let mut child = spawned.child;
            tokio::spawn(async move {
                let kill = job.kill_requested_token();
                let exited = tokio::select! {
                    status = child.wait() => Some(status),
                    _ = kill.cancelled() => None,
                };
                let status = match exited {
                    Some(status) => status,
                    None => {
                        debug!("Force-terminating transcoder for {}", job.path().display());
                        if let Err(e) = child.start_kill() {
                            warn!("Failed to kill transcoder for {}: {}", job.path().display(), e);
                        }
                        child.wait().await
                    }
                };
                let code = status.unwrap_or_else(|e| {
                    warn!("Failed to await transcoder for {}: {}", job.path().display(), e);
                    None
                });
                manager.on_process_exited(&job, code);
            });
        }

        tokio::spawn(Throttler::new(job.clone(), &self.options).run(self.config.throttle_interval));

        if let Some(extension) = segment_extension {
            let cleaner = SegmentCleaner::new(
                job.clone(),
                &self.options,
                extension,
                self.config.cleaner_delete_delay,
            );
            tokio::spawn(cleaner.run(self.config.cleaner_interval));
        }

        Ok(job)
    }

    fn on_process_exited(&self, job: &TranscodingJob, code: Option<i32>) {
        job.mark_exited(code);
        job.shutdown_token().cancel();
        match code {
            Some(0) => info!("Transcoder for {} finished", job.path().display()),
            _ => warn!(
                "Transcoder for {} exited with {:?}",
                job.path().display(),
                code
            ),
        }
        // Exited jobs stay registered so waiters see the exit; the idle
        // timer removes them once nobody is reading.
        if job.active_request_count() == 0 && self.is_registered(job) {
            self.start_kill_timer(job);
        }
    }

    fn is_registered(&self, job: &TranscodingJob) -> bool {
        self.jobs
            .read()
            .get(job.path())
            .is_some_and(|registered| registered.is_same(job))
    }

    pub fn get_job_by_path(&self, path: &Path, job_type: TranscodingJobType) -> Option<TranscodingJob> {
        self.jobs
            .read()
            .get(path)
            .filter(|job| job.job_type() == job_type)
            .cloned()
    }

    pub fn get_job_by_session(&self, play_session_id: &str) -> Option<TranscodingJob> {
        self.jobs
            .read()
            .values()
            .find(|job| job.play_session_id() == Some(play_session_id))
            .cloned()
    }

    /// Marks a request as using the job at `path` and stops its idle timer.
    pub fn on_transcode_begin_request(
        &self,
        path: &Path,
        job_type: TranscodingJobType,
    ) -> Option<TranscodingJob> {
        let job = self.get_job_by_path(path, job_type)?;
        job.begin_request();
        job.cancel_kill_timer();
        Some(job)
    }

    /// Ends a request; the last one out arms the idle-kill timer.
    pub fn on_transcode_end_request(&self, job: &TranscodingJob) {
        if job.end_request() == 0 {
            self.start_kill_timer(job);
        }
    }

    /// Keeps the session's job alive by restarting its idle countdown.
    pub fn ping_transcoding_job(&self, play_session_id: &str) -> bool {
        let jobs: Vec<TranscodingJob> = self
            .jobs
            .read()
            .values()
            .filter(|job| job.play_session_id() == Some(play_session_id))
            .cloned()
            .collect();

        for job in &jobs {
            job.ping();
            if job.has_exited() {
                job.cancel_kill_timer();
            } else if job.has_kill_timer() || job.active_request_count() == 0 {
                self.start_kill_timer(job);
            }
        }
        !jobs.is_empty()
    }

    fn idle_timeout(&self, job: &TranscodingJob) -> std::time::Duration {
        match job.job_type() {
            TranscodingJobType::Progressive => self.config.progressive_idle_timeout,
            _ => self.config.hls_idle_timeout,
        }
    }

    fn start_kill_timer(&self, job: &TranscodingJob) {
        let timer = CancellationToken::new();
        job.replace_kill_timer(timer.clone());
        let timeout = self.idle_timeout(job);
        let manager = self.clone();
        let job = job.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    if job.active_request_count() == 0 {
                        info!("Stopping idle transcoder for {}", job.path().display());
                        manager.kill_job(&job, true).await;
                    }
                }
            }
        });
    }

    /// Stops jobs of `device_id`, optionally narrowed to one play session.
    ///
    /// Returns how many jobs were stopped.
    pub async fn kill_transcoding_jobs(
        &self,
        device_id: &str,
        play_session_id: Option<&str>,
        delete_files: bool,
    ) -> usize {
        self.kill_transcoding_jobs_where(
            |job| {
                job.device_id() == Some(device_id)
                    && play_session_id.is_none_or(|session| job.play_session_id() == Some(session))
            },
            delete_files,
        )
        .await
    }

    /// Stops every registered job matching `predicate`.
    pub async fn kill_transcoding_jobs_where<F>(&self, predicate: F, delete_files: bool) -> usize
    where
        F: Fn(&TranscodingJob) -> bool,
    {
        let matching: Vec<TranscodingJob> = self
            .jobs
            .read()
            .values()
            .filter(|job| predicate(job))
            .cloned()
            .collect();

        let count = matching.len();
        futures::future::join_all(matching.iter().map(|job| self.kill_job(job, delete_files))).await;
        count
    }

    /// Unregisters and stops one job: quit first, force after the grace period.
    ///
    /// Returns once the process has exited.
    pub async fn kill_job(&self, job: &TranscodingJob, delete_files: bool) {
        {
            let mut jobs = self.jobs.write();
            if jobs.get(job.path()).is_some_and(|registered| registered.is_same(job)) {
                jobs.remove(job.path());
            }
        }
        job.dispose();

        if !job.has_exited() {
            debug!("Stopping transcoder for {}", job.path().display());
            let asked = job.quit().is_ok();
            if !asked || !job.wait_for_exit_timeout(self.config.graceful_stop_timeout).await {
                warn!(
                    "Transcoder for {} ignored quit, killing it",
                    job.path().display()
                );
                job.request_kill();
                job.wait_for_exit().await;
            }
        }

        if delete_files {
            delete_partial_stream_files(job.path()).await;
        }
    }

    /// Exclusive access to one output path.
    ///
    /// # Errors
    /// - `TranscodingError::Cancelled` - `cancel` fired while waiting
    pub async fn lock(
        &self,
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathLockGuard, TranscodingError> {
        self.path_locks.lock(output_path, cancel).await
    }

    pub fn active_jobs(&self) -> Vec<ActiveEncodingInfo> {
        let mut jobs: Vec<ActiveEncodingInfo> =
            self.jobs.read().values().map(ActiveEncodingInfo::from).collect();
        jobs.sort_by_key(|info| info.started_at);
        jobs
    }

    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }

    /// Stops every job. Called once at process shutdown.
    pub async fn shutdown(&self) {
        let count = self.kill_transcoding_jobs_where(|_| true, false).await;
        if count > 0 {
            info!("Stopped {} transcoders on shutdown", count);
        }
    }
}
