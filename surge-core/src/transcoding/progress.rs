//! Transcoder stderr progress parsing.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::job::TranscodingJob;
use crate::ticks::parse_ffmpeg_time;

/// One progress report parsed from a stderr status line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub frame: Option<u64>,
    pub framerate: Option<f32>,
    /// Output position in ticks, relative to the start of this run
    pub position_ticks: Option<i64>,
    pub bytes_transcoded: Option<u64>,
    /// Bits per second
    pub bitrate: Option<u64>,
}

impl ProgressUpdate {
    pub fn is_empty(&self) -> bool {
        self.frame.is_none()
            && self.framerate.is_none()
            && self.position_ticks.is_none()
            && self.bytes_transcoded.is_none()
            && self.bitrate.is_none()
    }
}

/// Parses a status line such as
/// `frame=  123 fps= 45 q=-1.0 size=    1024kB time=00:00:05.12 bitrate=1234.5kbits/s speed=1.2x`.
///
/// Returns `None` for lines that carry no progress fields.
pub fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    if !line.contains("time=") && !line.contains("frame=") {
        return None;
    }

    let mut update = ProgressUpdate::default();

    if let Some(frame) = extract_value(line, "frame=")
        && let Ok(frame) = frame.parse()
    {
        update.frame = Some(frame);
    }

    if let Some(fps) = extract_value(line, "fps=")
        && let Ok(fps) = fps.parse::<f32>()
    {
        update.framerate = Some(fps);
    }

    if let Some(time) = extract_value(line, "time=") {
        update.position_ticks = parse_ffmpeg_time(time);
    }

    if let Some(size) = extract_value(line, "size=") {
        update.bytes_transcoded = parse_size(size);
    }

    if let Some(bitrate) = extract_value(line, "bitrate=")
        && let Some(kbps) = bitrate.strip_suffix("kbits/s")
        && let Ok(kbps) = kbps.trim().parse::<f64>()
    {
        update.bitrate = Some((kbps * 1000.0) as u64);
    }

    (!update.is_empty()).then_some(update)
}

/// Value following `key`, skipping the padding ffmpeg puts after `=`.
fn extract_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let value = &rest[..end];
    (!value.is_empty()).then_some(value)
}

fn parse_size(value: &str) -> Option<u64> {
    let lower = value.to_ascii_lowercase();
    let (number, multiplier) = if let Some(n) = lower.strip_suffix("kib") {
        (n, 1024)
    } else if let Some(n) = lower.strip_suffix("kb") {
        (n, 1024)
    } else if let Some(n) = lower.strip_suffix("mib") {
        (n, 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix("mb") {
        (n, 1024 * 1024)
    } else if let Some(n) = lower.strip_suffix('b') {
        (n, 1)
    } else {
        (lower.as_str(), 1)
    };
    number.trim().parse::<u64>().ok().map(|n| n * multiplier)
}

/// Drains the child's stderr into `log_path` and reports progress to `job`.
///
/// Status lines are terminated by `\r`, regular log lines by `\n`.
pub async fn pump_stderr(
    mut stderr: Box<dyn AsyncRead + Send + Unpin>,
    log_path: Option<&Path>,
    job: TranscodingJob,
) {
    let mut log = match log_path {
        Some(path) => match File::create(path).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("Failed to create transcode log {}: {}", path.display(), e);
                None
            }
        },
        None => None,
    };

    let mut buf = [0u8; 4096];
    let mut pending = Vec::new();
    loop {
        let n = match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("Transcoder stderr closed: {}", e);
                break;
            }
        };

        if let Some(file) = log.as_mut()
            && let Err(e) = file.write_all(&buf[..n]).await
        {
            warn!("Failed to write transcode log: {}", e);
            log = None;
        }

        pending.extend_from_slice(&buf[..n]);
        while let Some(pos) = pending.iter().position(|b| *b == b'\r' || *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(update) = parse_progress_line(line.trim()) {
                job.report_progress(&update);
            }
        }
    }

    if !pending.is_empty()
        && let Some(update) = parse_progress_line(String::from_utf8_lossy(&pending).trim())
    {
        job.report_progress(&update);
    }

    if let Some(mut file) = log {
        let _ = file.flush().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_padded_status_line() {
        let update = parse_progress_line(
            "frame=  123 fps= 45 q=-1.0 size=    1024kB time=00:00:05.12 bitrate=1234.5kbits/s speed=1.2x",
        )
        .unwrap();
        assert_eq!(update.frame, Some(123));
        assert_eq!(update.framerate, Some(45.0));
        assert_eq!(update.bytes_transcoded, Some(1024 * 1024));
        assert_eq!(update.position_ticks, Some(51_200_000));
        assert_eq!(update.bitrate, Some(1_234_500));
    }

    #[test]
    fn test_parse_kib_and_na_bitrate() {
        let update =
            parse_progress_line("size=     256KiB time=00:01:00.00 bitrate=N/A speed=2x").unwrap();
        assert_eq!(update.bytes_transcoded, Some(256 * 1024));
        assert_eq!(update.position_ticks, Some(600_000_000));
        assert_eq!(update.bitrate, None);
        assert_eq!(update.frame, None);
    }

    #[test]
    fn test_non_progress_lines_ignored() {
        assert!(parse_progress_line("Input #0, matroska,webm, from 'a.mkv':").is_none());
        assert!(parse_progress_line("").is_none());
    }
}
