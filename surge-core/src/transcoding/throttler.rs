//! Pauses transcoders that have run far ahead of their client.

use std::time::Duration;

use tracing::{debug, trace};

use super::job::TranscodingJob;
use crate::config::EncodingOptions;
use crate::ticks::TICKS_PER_SECOND;

/// Per-job throttling loop.
#[derive(Debug, Clone)]
pub struct Throttler {
    job: TranscodingJob,
    enabled: bool,
    threshold: Duration,
}

impl Throttler {
    pub fn new(job: TranscodingJob, options: &EncodingOptions) -> Self {
        Self {
            job,
            enabled: options.enable_throttling,
            threshold: options.effective_throttle_delay(),
        }
    }

    /// Whether the transcoder is far enough ahead to be paused.
    ///
    /// Segmented streams compare positions in time; progressive streams,
    /// which report no download position, compare bytes scaled by the
    /// threshold's share of the transcoded duration.
    pub fn should_throttle(&self) -> bool {
        let transcoding = self.job.transcoding_position_ticks().unwrap_or(0);
        let download = self.job.download_position_ticks().unwrap_or(0);
        let gap_ticks = self.threshold.as_secs() as i64 * TICKS_PER_SECOND;

        if download > 0 && transcoding > 0 {
            return transcoding - download > gap_ticks;
        }

        let bytes_downloaded = self.job.bytes_downloaded();
        if bytes_downloaded > 0 && transcoding > 0 {
            let bytes_transcoded = self.job.bytes_transcoded() as f64;
            let target_gap = bytes_transcoded * (gap_ticks as f64 / transcoding as f64);
            let gap = bytes_transcoded - bytes_downloaded as f64;
            return gap > target_gap;
        }

        false
    }

    /// One evaluation. Returns whether the job is paused afterwards.
    pub fn tick(&self) -> bool {
        if !self.enabled || self.job.has_exited() {
            return false;
        }
        if self.should_throttle() {
            if self.job.pause() {
                debug!("Throttling transcoder for {}", self.job.path().display());
            }
            true
        } else {
            if self.job.resume() {
                debug!("Unthrottling transcoder for {}", self.job.path().display());
            }
            false
        }
    }

    /// Resumes the transcoder if this throttler paused it.
    pub fn unpause(&self) {
        if self.job.resume() {
            trace!("Resumed transcoder for {}", self.job.path().display());
        }
    }

    /// Evaluates every `interval` until the job is disposed or exits.
    pub async fn run(self, interval: Duration) {
        if !self.enabled {
            return;
        }
        let shutdown = self.job.shutdown_token();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.job.wait_for_exit() => break,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
        self.unpause();
    }
}
