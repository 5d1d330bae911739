//! Deletes segments the client has already played past.

use std::time::Duration;

use tracing::trace;

use super::files::delete_segments_in_range;
use super::job::TranscodingJob;
use crate::config::EncodingOptions;
use crate::ticks::TICKS_PER_SECOND;

/// Highest segment index safe to delete, if any.
///
/// Keeps `keep_seconds` of already-downloaded media behind the client.
pub fn index_to_delete(download_position_ticks: i64, keep_seconds: u64, segment_length: u32) -> Option<i64> {
    let download_seconds = download_position_ticks / TICKS_PER_SECOND;
    let keep_seconds = keep_seconds as i64;
    if segment_length == 0 || download_seconds <= 0 || download_seconds <= keep_seconds {
        return None;
    }
    Some((download_seconds - keep_seconds) / i64::from(segment_length))
}

/// Per-job segment deletion loop.
#[derive(Debug, Clone)]
pub struct SegmentCleaner {
    job: TranscodingJob,
    enabled: bool,
    keep_seconds: u64,
    extension: String,
    delete_delay: Duration,
}

impl SegmentCleaner {
    pub fn new(
        job: TranscodingJob,
        options: &EncodingOptions,
        extension: impl Into<String>,
        delete_delay: Duration,
    ) -> Self {
        Self {
            job,
            enabled: options.enable_segment_deletion,
            keep_seconds: options.effective_segment_keep_seconds(),
            extension: extension.into(),
            delete_delay,
        }
    }

    /// One sweep. Returns the number of deleted segments.
    pub async fn sweep(&self) -> usize {
        if !self.enabled {
            return 0;
        }
        let Some(download_position) = self.job.download_position_ticks() else {
            return 0;
        };
        let Some(last) = index_to_delete(download_position, self.keep_seconds, self.job.segment_length())
        else {
            return 0;
        };

        // Let in-flight reads of the oldest segments finish
        tokio::time::sleep(self.delete_delay).await;
        trace!(
            "Cleaning segments 0..={} of {}",
            last,
            self.job.path().display()
        );
        delete_segments_in_range(self.job.path(), &self.extension, 0, last).await
    }

    /// Sweeps every `interval` until the job is disposed.
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
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.sweep() => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::encoding::TranscodingJobType;
    use crate::transcoding::files::segment_path;
    use crate::transcoding::job::TranscodingJobSpec;

    #[test]
    fn test_index_to_delete_boundary() {
        assert_eq!(index_to_delete(50 * TICKS_PER_SECOND, 20, 4), Some(7));
        assert_eq!(index_to_delete(20 * TICKS_PER_SECOND, 20, 4), None);
        assert_eq!(index_to_delete(23 * TICKS_PER_SECOND, 20, 4), Some(0));
        assert_eq!(index_to_delete(0, 20, 4), None);
        assert_eq!(index_to_delete(50 * TICKS_PER_SECOND, 20, 0), None);
    }

    #[tokio::test]
    async fn test_sweep_deletes_played_segments() {
        let dir = TempDir::new().unwrap();
        let playlist = dir.path().join("abc.m3u8");
        for i in 0..12 {
            std::fs::write(segment_path(&playlist, i, ".ts"), b"x").unwrap();
        }

        let mut spec = TranscodingJobSpec::new(&playlist, TranscodingJobType::Hls);
        spec.segment_length = 4;
        let (job, _rx) = TranscodingJob::new(spec);
        job.set_download_position_ticks(50 * TICKS_PER_SECOND);

        let options = EncodingOptions {
            enable_segment_deletion: true,
            segment_keep_seconds: 20,
            ..Default::default()
        };
        let cleaner = SegmentCleaner::new(job, &options, ".ts", Duration::ZERO);

        assert_eq!(cleaner.sweep().await, 8);
        assert!(!segment_path(&playlist, 7, ".ts").exists());
        assert!(segment_path(&playlist, 8, ".ts").exists());
    }

    #[tokio::test]
    async fn test_sweep_deletes_first_segment() {
        let dir = TempDir::new().unwrap();
        let playlist = dir.path().join("abc.m3u8");
        for i in 0..3 {
            std::fs::write(segment_path(&playlist, i, ".ts"), b"x").unwrap();
        }

        let mut spec = TranscodingJobSpec::new(&playlist, TranscodingJobType::Hls);
        spec.segment_length = 4;
        let (job, _rx) = TranscodingJob::new(spec);
        job.set_download_position_ticks(23 * TICKS_PER_SECOND);

        let options = EncodingOptions {
            enable_segment_deletion: true,
            segment_keep_seconds: 20,
            ..Default::default()
        };
        let cleaner = SegmentCleaner::new(job, &options, ".ts", Duration::ZERO);

        assert_eq!(cleaner.sweep().await, 1);
        assert!(!segment_path(&playlist, 0, ".ts").exists());
        assert!(segment_path(&playlist, 1, ".ts").exists());
    }

    #[tokio::test]
    async fn test_disabled_cleaner_keeps_everything() {
        let dir = TempDir::new().unwrap();
        let playlist = dir.path().join("abc.m3u8");
        std::fs::write(segment_path(&playlist, 0, ".ts"), b"x").unwrap();

        let (job, _rx) = TranscodingJob::new(TranscodingJobSpec::new(&playlist, TranscodingJobType::Hls));
        job.set_download_position_ticks(500 * TICKS_PER_SECOND);
        let cleaner = SegmentCleaner::new(job, &EncodingOptions::default(), ".ts", Duration::ZERO);

        assert_eq!(cleaner.sweep().await, 0);
        assert!(segment_path(&playlist, 0, ".ts").exists());
    }
}
