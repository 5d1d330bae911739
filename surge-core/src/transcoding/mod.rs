//! Transcoding job supervision.
//!
//! Owns the external transcoder processes: launching them, tracking their
//! progress and exit, guarding each output path so only one process writes
//! it, and the per-job throttling and segment cleanup loops.

pub mod cleaner;
pub mod files;
pub mod job;
pub mod path_lock;
pub mod process;
pub mod progress;
pub mod supervisor;
pub mod throttler;

use std::path::PathBuf;

pub use cleaner::SegmentCleaner;
pub use job::{JobState, TranscodingJob, TranscodingJobSpec};
pub use path_lock::{PathLockGuard, PathLocks};
pub use process::{
    FfmpegLauncher, ProcessCommand, ProcessLauncher, ProcessSpec, SpawnedProcess, TranscoderChild,
};
pub use progress::ProgressUpdate;
pub use supervisor::{ActiveEncodingInfo, StartRequest, TranscodeManager};
pub use throttler::Throttler;

/// Errors raised by the job supervisor.
#[derive(Debug, thiserror::Error)]
pub enum TranscodingError {
    #[error("Failed to start transcoder: {reason}")]
    StartFailed { reason: String },

    #[error("Transcoder control channel closed: {reason}")]
    ControlFailed { reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("File operation failed for {path}: {reason}")]
    Io { path: PathBuf, reason: String },
}
