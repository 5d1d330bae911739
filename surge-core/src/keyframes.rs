//! Keyframe extraction with ffprobe.
//!
//! Keyframe timestamps let stream-copy playlists cut segments exactly where
//! the copied bitstream can start. Extraction is best effort: any failure
//! yields `None` and the playlist falls back to equal-length segments.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::ticks::seconds_to_ticks;

/// Errors raised while extracting keyframes.
#[derive(Debug, thiserror::Error)]
pub enum KeyframeError {
    #[error("Probe tool failed: {reason}")]
    ToolFailed { reason: String },

    #[error("No duration in probe output for {path}")]
    MissingDuration { path: PathBuf },
}

/// Keyframe positions and total duration of one source file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyframeData {
    /// Ascending keyframe timestamps in ticks
    pub keyframe_ticks: Vec<i64>,
    pub total_duration_ticks: i64,
}

impl KeyframeData {
    pub fn new(keyframe_ticks: Vec<i64>, total_duration_ticks: i64) -> Self {
        Self {
            keyframe_ticks,
            total_duration_ticks,
        }
    }
}

/// ffprobe arguments listing keyframe packets and durations as CSV.
pub fn keyframe_probe_args(path: &Path) -> Vec<String> {
    let mut args: Vec<String> = [
        "-fflags",
        "+genpts",
        "-v",
        "error",
        "-skip_frame",
        "nokey",
        "-show_entries",
        "format=duration",
        "-show_entries",
        "stream=duration",
        "-show_entries",
        "packet=pts_time,flags",
        "-select_streams",
        "v",
        "-of",
        "csv",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    args.push(path.to_string_lossy().into_owned());
    args
}

/// Parses ffprobe CSV output into keyframe data.
///
/// Lines look like `packet,<pts_time>,<flags>`, `stream,<duration>` and
/// `format,<duration>`. The video stream duration wins over the container
/// duration when both are present.
pub fn parse_keyframe_csv(output: &str) -> Option<KeyframeData> {
    let mut keyframes = Vec::new();
    let mut stream_duration: Option<f64> = None;
    let mut format_duration: Option<f64> = None;

    for line in output.lines() {
        let mut fields = line.trim().split(',');
        match fields.next() {
            Some("packet") => {
                let (Some(pts), Some(flags)) = (fields.next(), fields.next()) else {
                    continue;
                };
                if !flags.starts_with('K') {
                    continue;
                }
                if let Ok(seconds) = pts.parse::<f64>() {
                    keyframes.push(seconds_to_ticks(seconds));
                }
            }
            Some("stream") => {
                if let Some(Ok(duration)) = fields.next().map(str::parse::<f64>) {
                    stream_duration = Some(duration);
                }
            }
            Some("format") => {
                if let Some(Ok(duration)) = fields.next().map(str::parse::<f64>) {
                    format_duration = Some(duration);
                }
            }
            _ => {}
        }
    }

    let duration = stream_duration.or(format_duration)?;
    keyframes.sort_unstable();
    keyframes.dedup();
    Some(KeyframeData::new(keyframes, seconds_to_ticks(duration)))
}

/// Runs ffprobe against `path` and parses its keyframes.
///
/// # Errors
/// - `KeyframeError::ToolFailed` - ffprobe could not be run or exited non-zero
/// - `KeyframeError::MissingDuration` - Output had no usable duration
pub async fn extract_keyframes(ffprobe: &Path, path: &Path) -> Result<KeyframeData, KeyframeError> {
    let output = Command::new(ffprobe)
        .args(keyframe_probe_args(path))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| KeyframeError::ToolFailed {
            reason: format!("Failed to run {}: {e}", ffprobe.display()),
        })?;

    if !output.status.success() {
        return Err(KeyframeError::ToolFailed {
            reason: format!(
                "ffprobe exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    parse_keyframe_csv(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
        KeyframeError::MissingDuration {
            path: path.to_path_buf(),
        }
    })
}

/// Extraction that reports failure as `None`.
pub async fn try_extract_keyframes(ffprobe: &Path, path: &Path) -> Option<KeyframeData> {
    match extract_keyframes(ffprobe, path).await {
        Ok(data) => {
            debug!(
                "Extracted {} keyframes from {}",
                data.keyframe_ticks.len(),
                path.display()
            );
            Some(data)
        }
        Err(e) => {
            warn!("Keyframe extraction failed for {}: {}", path.display(), e);
            None
        }
    }
}

/// In-memory LRU of extracted keyframes keyed by source path.
#[derive(Clone)]
pub struct KeyframeCache {
    ffprobe: PathBuf,
    entries: Arc<Mutex<LruCache<PathBuf, Arc<KeyframeData>>>>,
}

impl KeyframeCache {
    pub const DEFAULT_CAPACITY: usize = 256;

    pub fn new(ffprobe: impl Into<PathBuf>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ffprobe: ffprobe.into(),
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    pub fn get(&self, path: &Path) -> Option<Arc<KeyframeData>> {
        self.entries.lock().get(path).cloned()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, data: KeyframeData) -> Arc<KeyframeData> {
        let data = Arc::new(data);
        self.entries.lock().put(path.into(), Arc::clone(&data));
        data
    }

    /// Cached keyframes for `path`, probing on a miss.
    ///
    /// Failures are not cached so a later request can retry.
    pub async fn get_or_extract(&self, path: &Path) -> Option<Arc<KeyframeData>> {
        if let Some(hit) = self.get(path) {
            return Some(hit);
        }
        let data = try_extract_keyframes(&self.ffprobe, path).await?;
        Some(self.insert(path, data))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticks::TICKS_PER_SECOND;

    const SAMPLE: &str = "\
packet,0.000000,K__
packet,0.041708,___
packet,5.005000,K__
packet,10.010000,K_D
stream,12.345000
format,12.400000
";

    #[test]
    fn test_parse_keyframe_csv() {
        let data = parse_keyframe_csv(SAMPLE).unwrap();
        assert_eq!(data.keyframe_ticks, vec![0, 50_050_000, 100_100_000]);
        assert_eq!(data.total_duration_ticks, 123_450_000);
    }

    #[test]
    fn test_parse_falls_back_to_format_duration() {
        let data = parse_keyframe_csv("packet,2.0,K_\nformat,30.5\n").unwrap();
        assert_eq!(data.keyframe_ticks, vec![2 * TICKS_PER_SECOND]);
        assert_eq!(data.total_duration_ticks, 305_000_000);
    }

    #[test]
    fn test_parse_without_duration_fails() {
        assert!(parse_keyframe_csv("packet,2.0,K_\n").is_none());
        assert!(parse_keyframe_csv("").is_none());
    }

    #[test]
    fn test_probe_args_end_with_path() {
        let args = keyframe_probe_args(Path::new("/media/a.mkv"));
        assert_eq!(args.last().map(String::as_str), Some("/media/a.mkv"));
        assert!(args.contains(&"packet=pts_time,flags".to_string()));
    }

    #[test]
    fn test_cache_evicts_least_recent() {
        let cache = KeyframeCache::new("ffprobe", 2);
        cache.insert("/a.mkv", KeyframeData::new(vec![0], 10));
        cache.insert("/b.mkv", KeyframeData::new(vec![0], 20));
        assert!(cache.get(Path::new("/a.mkv")).is_some());
        cache.insert("/c.mkv", KeyframeData::new(vec![0], 30));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(Path::new("/b.mkv")).is_none());
        assert_eq!(cache.get(Path::new("/c.mkv")).unwrap().total_duration_ticks, 30);
    }

    #[tokio::test]
    async fn test_missing_tool_yields_none() {
        let result = try_extract_keyframes(
            Path::new("/nonexistent/ffprobe"),
            Path::new("/media/a.mkv"),
        )
        .await;
        assert!(result.is_none());
    }
}
