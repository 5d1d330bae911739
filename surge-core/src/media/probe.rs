//! ffprobe-backed source descriptors.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use super::{MediaProtocol, MediaSourceInfo, MediaStream, MediaStreamType, VideoRangeType};
use crate::ticks::seconds_to_ticks;

/// Errors raised while resolving or probing a source.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("Media item not found: {item_id}")]
    NotFound { item_id: String },

    #[error("Probe tool failed: {reason}")]
    ToolFailed { reason: String },

    #[error("Unreadable probe output: {reason}")]
    InvalidOutput { reason: String },
}

/// Resolves an item identifier into a playable source description.
///
/// Library management lives outside the engine; this is the seam through
/// which callers supply source metadata.
#[async_trait]
pub trait MediaSourceProvider: Send + Sync {
    /// Looks up the source for `item_id`.
    ///
    /// # Errors
    /// - `ProbeError::NotFound` - No such item
    /// - `ProbeError::ToolFailed` - Metadata could not be produced
    async fn media_source(&self, item_id: &str) -> Result<MediaSourceInfo, ProbeError>;
}

/// Treats item ids as paths relative to a media directory and probes them on demand.
#[derive(Debug, Clone)]
pub struct ProbingMediaSourceProvider {
    ffprobe_path: PathBuf,
    media_dir: PathBuf,
}

impl ProbingMediaSourceProvider {
    pub fn new(ffprobe_path: impl Into<PathBuf>, media_dir: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            media_dir: media_dir.into(),
        }
    }

    /// Maps an item id onto a file below the media directory.
    ///
    /// Ids that would escape the directory are rejected.
    pub fn resolve_path(&self, item_id: &str) -> Option<PathBuf> {
        let relative = Path::new(item_id);
        let is_contained = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if item_id.is_empty() || !is_contained {
            return None;
        }
        Some(self.media_dir.join(relative))
    }
}

#[async_trait]
impl MediaSourceProvider for ProbingMediaSourceProvider {
    async fn media_source(&self, item_id: &str) -> Result<MediaSourceInfo, ProbeError> {
        let path = self
            .resolve_path(item_id)
            .filter(|path| path.is_file())
            .ok_or_else(|| ProbeError::NotFound {
                item_id: item_id.to_string(),
            })?;

        let mut source = probe_media_source(&self.ffprobe_path, &path).await?;
        source.id = item_id.to_string();
        Ok(source)
    }
}

/// Runs ffprobe against `path` and converts its JSON report.
///
/// # Errors
/// - `ProbeError::ToolFailed` - ffprobe could not be started or exited non-zero
/// - `ProbeError::InvalidOutput` - ffprobe output was not the expected JSON
pub async fn probe_media_source(
    ffprobe_path: &Path,
    path: &Path,
) -> Result<MediaSourceInfo, ProbeError> {
    let output = Command::new(ffprobe_path)
        .args(["-v", "error"])
        .args(["-print_format", "json"])
        .args(["-show_format", "-show_streams"])
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| ProbeError::ToolFailed {
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(ProbeError::ToolFailed {
            reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let report: ProbeReport =
        serde_json::from_slice(&output.stdout).map_err(|e| ProbeError::InvalidOutput {
            reason: e.to_string(),
        })?;

    debug!(
        "Probed {}: {} streams",
        path.display(),
        report.streams.len()
    );

    Ok(report.into_media_source(path))
}

#[derive(Debug, Deserialize)]
struct ProbeReport {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ProbeStream {
    index: i32,
    codec_type: Option<String>,
    codec_name: Option<String>,
    codec_tag_string: Option<String>,
    profile: Option<String>,
    level: Option<i64>,
    width: Option<u32>,
    height: Option<u32>,
    bit_rate: Option<String>,
    bits_per_raw_sample: Option<String>,
    pix_fmt: Option<String>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    field_order: Option<String>,
    sample_aspect_ratio: Option<String>,
    refs: Option<u32>,
    is_avc: Option<String>,
    color_transfer: Option<String>,
    channels: Option<u32>,
    channel_layout: Option<String>,
    sample_rate: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    disposition: HashMap<String, i64>,
    #[serde(default)]
    side_data_list: Vec<serde_json::Value>,
}

impl ProbeReport {
    fn into_media_source(self, path: &Path) -> MediaSourceInfo {
        let media_streams: Vec<MediaStream> = self
            .streams
            .into_iter()
            .filter_map(ProbeStream::into_media_stream)
            .collect();

        let format = self.format;
        let container = format
            .as_ref()
            .and_then(|f| f.format_name.clone())
            .map(|name| normalize_container(&name));
        let run_time_ticks = format
            .as_ref()
            .and_then(|f| f.duration.as_deref())
            .and_then(|d| d.parse::<f64>().ok())
            .map(seconds_to_ticks);
        let bitrate = format
            .as_ref()
            .and_then(|f| f.bit_rate.as_deref())
            .and_then(|b| b.parse().ok());

        let default_audio_stream_index = media_streams
            .iter()
            .find(|s| s.stream_type == MediaStreamType::Audio && s.is_default)
            .map(|s| s.index);

        MediaSourceInfo {
            id: String::new(),
            path: path.to_string_lossy().into_owned(),
            protocol: MediaProtocol::File,
            container,
            run_time_ticks,
            bitrate,
            media_streams,
            default_audio_stream_index,
            ..Default::default()
        }
    }
}

impl ProbeStream {
    fn into_media_stream(self) -> Option<MediaStream> {
        let stream_type = match self.codec_type.as_deref()? {
            "video" if self.disposition.get("attached_pic") == Some(&1) => {
                MediaStreamType::EmbeddedImage
            }
            "video" => MediaStreamType::Video,
            "audio" => MediaStreamType::Audio,
            "subtitle" => MediaStreamType::Subtitle,
            "data" | "attachment" => MediaStreamType::Data,
            _ => return None,
        };

        let video_range_type = if stream_type == MediaStreamType::Video {
            self.range_type()
        } else {
            VideoRangeType::Unknown
        };
        let bit_depth = self
            .bits_per_raw_sample
            .as_deref()
            .and_then(|b| b.parse().ok())
            .or_else(|| self.pix_fmt.as_deref().map(bit_depth_from_pixel_format));

        Some(MediaStream {
            index: self.index,
            stream_type,
            codec: self.codec_name,
            codec_tag: self.codec_tag_string,
            profile: self.profile,
            level: self.level.filter(|l| *l > 0).map(|l| l as f64),
            width: self.width,
            height: self.height,
            bit_rate: self.bit_rate.as_deref().and_then(|b| b.parse().ok()),
            bit_depth,
            ref_frames: self.refs,
            pixel_format: self.pix_fmt,
            average_frame_rate: self.avg_frame_rate.as_deref().and_then(parse_rational),
            real_frame_rate: self.r_frame_rate.as_deref().and_then(parse_rational),
            is_interlaced: self
                .field_order
                .as_deref()
                .is_some_and(|order| !order.is_empty() && order != "progressive" && order != "unknown"),
            is_anamorphic: self
                .sample_aspect_ratio
                .as_deref()
                .map(|sar| sar != "1:1" && sar != "0:1"),
            is_avc: self.is_avc.as_deref().map(|v| v == "true" || v == "1"),
            video_range_type,
            channels: self.channels,
            channel_layout: self.channel_layout,
            sample_rate: self.sample_rate.as_deref().and_then(|s| s.parse().ok()),
            language: self.tags.get("language").cloned(),
            title: self.tags.get("title").cloned(),
            is_default: self.disposition.get("default") == Some(&1),
            is_forced: self.disposition.get("forced") == Some(&1),
            is_external: false,
            path: None,
        })
    }

    fn range_type(&self) -> VideoRangeType {
        let side_data_type = |value: &serde_json::Value| {
            value
                .get("side_data_type")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string()
        };

        if let Some(dovi) = self
            .side_data_list
            .iter()
            .find(|v| side_data_type(v).contains("DOVI configuration"))
        {
            let compatibility = dovi
                .get("dv_bl_signal_compatibility_id")
                .and_then(|id| id.as_i64())
                .unwrap_or(0);
            return match compatibility {
                1 | 6 => VideoRangeType::DoViWithHdr10,
                2 => VideoRangeType::DoViWithSdr,
                4 => VideoRangeType::DoViWithHlg,
                _ => VideoRangeType::DoVi,
            };
        }

        match self.color_transfer.as_deref() {
            Some("smpte2084") => {
                let has_hdr10_plus = self
                    .side_data_list
                    .iter()
                    .any(|v| side_data_type(v).contains("HDR10+"));
                if has_hdr10_plus {
                    VideoRangeType::Hdr10Plus
                } else {
                    VideoRangeType::Hdr10
                }
            }
            Some("arib-std-b67") => VideoRangeType::Hlg,
            _ => VideoRangeType::Sdr,
        }
    }
}

/// Reduces ffprobe's demuxer alias list to the name clients use.
fn normalize_container(format_name: &str) -> String {
    let first = format_name.split(',').next().unwrap_or(format_name);
    match first {
        "matroska" => "mkv".to_string(),
        "mov" => "mp4".to_string(),
        "mpegts" => "ts".to_string(),
        other => other.to_string(),
    }
}

fn bit_depth_from_pixel_format(pixel_format: &str) -> u32 {
    if pixel_format.contains("12") {
        12
    } else if pixel_format.contains("10") || pixel_format == "p010le" {
        10
    } else {
        8
    }
}

fn parse_rational(value: &str) -> Option<f32> {
    let (numerator, denominator) = value.split_once('/')?;
    let numerator: f32 = numerator.parse().ok()?;
    let denominator: f32 = denominator.parse().ok()?;
    if denominator == 0.0 || numerator == 0.0 {
        return None;
    }
    Some(numerator / denominator)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "hevc", "profile": "Main 10",
             "level": 150, "width": 3840, "height": 2160, "pix_fmt": "yuv420p10le",
             "r_frame_rate": "24000/1001", "avg_frame_rate": "24000/1001",
             "field_order": "progressive", "sample_aspect_ratio": "1:1", "refs": 1,
             "color_transfer": "smpte2084",
             "side_data_list": [{"side_data_type": "DOVI configuration record",
                                 "dv_profile": 8, "dv_bl_signal_compatibility_id": 1}]},
            {"index": 1, "codec_type": "audio", "codec_name": "eac3", "channels": 6,
             "channel_layout": "5.1(side)", "sample_rate": "48000", "bit_rate": "640000",
             "tags": {"language": "eng"}, "disposition": {"default": 1, "forced": 0}},
            {"index": 2, "codec_type": "subtitle", "codec_name": "subrip",
             "tags": {"language": "fre", "title": "French"}, "disposition": {"default": 0, "forced": 1}}
        ],
        "format": {"format_name": "matroska,webm", "duration": "7170.171000", "bit_rate": "18000000"}
    }"#;

    #[test]
    fn test_probe_report_conversion() {
        let report: ProbeReport = serde_json::from_str(SAMPLE).unwrap();
        let source = report.into_media_source(Path::new("/media/film.mkv"));

        assert_eq!(source.container.as_deref(), Some("mkv"));
        assert_eq!(source.run_time_ticks, Some(71_701_710_000));
        assert_eq!(source.bitrate, Some(18_000_000));
        assert_eq!(source.default_audio_stream_index, Some(1));

        let video = &source.media_streams[0];
        assert_eq!(video.bit_depth, Some(10));
        assert_eq!(video.level, Some(150.0));
        assert_eq!(video.video_range_type, VideoRangeType::DoViWithHdr10);
        assert_eq!(video.is_anamorphic, Some(false));
        assert!(!video.is_interlaced);
        let fps = video.real_frame_rate.unwrap();
        assert!((fps - 23.976).abs() < 0.001);

        let audio = &source.media_streams[1];
        assert_eq!(audio.channels, Some(6));
        assert_eq!(audio.sample_rate, Some(48000));
        assert_eq!(audio.language.as_deref(), Some("eng"));

        let subtitle = &source.media_streams[2];
        assert!(subtitle.is_forced);
        assert!(subtitle.is_text_subtitle_stream());
        assert_eq!(subtitle.display_title(), "French");
    }

    #[test]
    fn test_resolve_path_rejects_traversal() {
        let provider = ProbingMediaSourceProvider::new("ffprobe", "/media");
        assert_eq!(
            provider.resolve_path("movies/film.mkv"),
            Some(PathBuf::from("/media/movies/film.mkv"))
        );
        assert_eq!(provider.resolve_path("../etc/passwd"), None);
        assert_eq!(provider.resolve_path("/etc/passwd"), None);
        assert_eq!(provider.resolve_path(""), None);
    }

    #[test]
    fn test_parse_rational() {
        assert_eq!(parse_rational("25/1"), Some(25.0));
        assert_eq!(parse_rational("0/0"), None);
        assert_eq!(parse_rational("bogus"), None);
    }
}
