//! Source media descriptors.
//!
//! The engine never scans libraries itself: callers hand it a
//! [`MediaSourceInfo`] describing one playable source and its streams. The
//! [`probe`] submodule can build one from ffprobe output when no richer
//! metadata store is available.

pub mod probe;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use probe::{MediaSourceProvider, ProbeError, ProbingMediaSourceProvider, probe_media_source};

/// Kind of elementary stream inside a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MediaStreamType {
    #[default]
    Video,
    Audio,
    Subtitle,
    /// Cover art and other attached pictures
    EmbeddedImage,
    Data,
}

/// Coarse dynamic range of a video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VideoRange {
    #[default]
    Unknown,
    Sdr,
    Hdr,
}

/// Detailed dynamic range signalling of a video stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VideoRangeType {
    #[default]
    Unknown,
    Sdr,
    Hdr10,
    Hlg,
    /// Dolby Vision without a compatible base layer
    DoVi,
    DoViWithHdr10,
    DoViWithHlg,
    DoViWithSdr,
    Hdr10Plus,
}

impl VideoRangeType {
    /// Name used by clients in `<codec>-rangetype` options.
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoRangeType::Unknown => "Unknown",
            VideoRangeType::Sdr => "SDR",
            VideoRangeType::Hdr10 => "HDR10",
            VideoRangeType::Hlg => "HLG",
            VideoRangeType::DoVi => "DOVI",
            VideoRangeType::DoViWithHdr10 => "DOVIWithHDR10",
            VideoRangeType::DoViWithHlg => "DOVIWithHLG",
            VideoRangeType::DoViWithSdr => "DOVIWithSDR",
            VideoRangeType::Hdr10Plus => "HDR10Plus",
        }
    }

    /// Parses a client-declared range type, case-insensitively.
    pub fn parse(value: &str) -> Option<Self> {
        let all = [
            VideoRangeType::Sdr,
            VideoRangeType::Hdr10,
            VideoRangeType::Hlg,
            VideoRangeType::DoVi,
            VideoRangeType::DoViWithHdr10,
            VideoRangeType::DoViWithHlg,
            VideoRangeType::DoViWithSdr,
            VideoRangeType::Hdr10Plus,
        ];
        all.into_iter()
            .find(|range| range.as_str().eq_ignore_ascii_case(value.trim()))
    }

    pub fn video_range(&self) -> VideoRange {
        match self {
            VideoRangeType::Unknown => VideoRange::Unknown,
            VideoRangeType::Sdr | VideoRangeType::DoViWithSdr => VideoRange::Sdr,
            _ => VideoRange::Hdr,
        }
    }

    /// True for every Dolby Vision flavour.
    pub fn is_dolby_vision(&self) -> bool {
        matches!(
            self,
            VideoRangeType::DoVi
                | VideoRangeType::DoViWithHdr10
                | VideoRangeType::DoViWithHlg
                | VideoRangeType::DoViWithSdr
        )
    }
}

impl std::fmt::Display for VideoRangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport used to reach the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MediaProtocol {
    #[default]
    File,
    Http,
    Rtmp,
    Rtsp,
    Udp,
    Rtp,
    Ftp,
}

impl MediaProtocol {
    pub fn is_remote(&self) -> bool {
        !matches!(self, MediaProtocol::File)
    }
}

const TEXT_SUBTITLE_CODECS: &[&str] = &[
    "srt", "subrip", "ass", "ssa", "webvtt", "vtt", "mov_text", "text", "smi", "sami",
];

/// One elementary stream of a source, as reported by the prober.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaStream {
    /// Absolute stream index within its input file
    pub index: i32,
    pub stream_type: MediaStreamType,
    pub codec: Option<String>,
    pub codec_tag: Option<String>,
    pub profile: Option<String>,
    /// Codec level as ffprobe reports it (41 for H.264 4.1, 150 for HEVC 5.0)
    pub level: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bit_rate: Option<u32>,
    pub bit_depth: Option<u32>,
    pub ref_frames: Option<u32>,
    pub pixel_format: Option<String>,
    pub average_frame_rate: Option<f32>,
    pub real_frame_rate: Option<f32>,
    pub is_interlaced: bool,
    pub is_anamorphic: Option<bool>,
    /// `Some(false)` marks H.264 in Annex B rather than length-prefixed form
    pub is_avc: Option<bool>,
    pub video_range_type: VideoRangeType,
    pub channels: Option<u32>,
    pub channel_layout: Option<String>,
    pub sample_rate: Option<u32>,
    pub language: Option<String>,
    pub title: Option<String>,
    pub is_default: bool,
    pub is_forced: bool,
    /// Stream lives in a sidecar file rather than the main input
    pub is_external: bool,
    /// Sidecar path for external streams
    pub path: Option<String>,
}

impl MediaStream {
    pub fn codec_is(&self, name: &str) -> bool {
        self.codec
            .as_deref()
            .is_some_and(|codec| codec.eq_ignore_ascii_case(name))
    }

    pub fn is_h264(&self) -> bool {
        self.codec_is("h264") || self.codec_is("avc")
    }

    pub fn is_hevc(&self) -> bool {
        self.codec_is("hevc") || self.codec_is("h265")
    }

    pub fn is_av1(&self) -> bool {
        self.codec_is("av1")
    }

    pub fn is_aac(&self) -> bool {
        self.codec_is("aac")
    }

    /// Whether this is a subtitle stream that can be rendered from text.
    pub fn is_text_subtitle_stream(&self) -> bool {
        self.stream_type == MediaStreamType::Subtitle
            && self.codec.as_deref().is_some_and(|codec| {
                TEXT_SUBTITLE_CODECS
                    .iter()
                    .any(|text| text.eq_ignore_ascii_case(codec))
            })
    }

    /// Frame rate used for comparisons: the real rate, else the average.
    pub fn reference_frame_rate(&self) -> Option<f32> {
        self.real_frame_rate.or(self.average_frame_rate)
    }

    pub fn video_range(&self) -> VideoRange {
        self.video_range_type.video_range()
    }

    /// Human-readable label for playlist `NAME` attributes.
    pub fn display_title(&self) -> String {
        match (&self.title, &self.language) {
            (Some(title), _) if !title.is_empty() => title.clone(),
            (_, Some(language)) if !language.is_empty() => language.clone(),
            _ => format!("Track {}", self.index),
        }
    }
}

/// A playable source plus everything the engine needs to know about it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaSourceInfo {
    pub id: String,
    /// Filesystem path or URL
    pub path: String,
    pub protocol: MediaProtocol,
    pub container: Option<String>,
    pub run_time_ticks: Option<i64>,
    pub bitrate: Option<u32>,
    pub media_streams: Vec<MediaStream>,
    pub default_audio_stream_index: Option<i32>,
    pub default_subtitle_stream_index: Option<i32>,
    pub read_at_native_framerate: bool,
    pub gen_pts_input: bool,
    pub ignore_dts: bool,
    pub ignore_index: bool,
    pub is_infinite_stream: bool,
    pub analyze_duration_ms: Option<u32>,
    pub required_http_headers: HashMap<String, String>,
    /// Identifier of an opened live stream that must be closed after use
    pub live_stream_id: Option<String>,
}

impl MediaSourceInfo {
    /// Streams of one type in index order.
    pub fn streams_of(&self, stream_type: MediaStreamType) -> Vec<&MediaStream> {
        let mut streams: Vec<&MediaStream> = self
            .media_streams
            .iter()
            .filter(|stream| stream.stream_type == stream_type)
            .collect();
        streams.sort_by_key(|stream| stream.index);
        streams
    }

    pub fn container_is(&self, name: &str) -> bool {
        self.container.as_deref().is_some_and(|container| {
            container
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(name))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_subtitle_detection() {
        let srt = MediaStream {
            stream_type: MediaStreamType::Subtitle,
            codec: Some("SubRip".to_string()),
            ..Default::default()
        };
        let pgs = MediaStream {
            stream_type: MediaStreamType::Subtitle,
            codec: Some("hdmv_pgs_subtitle".to_string()),
            ..Default::default()
        };
        assert!(srt.is_text_subtitle_stream());
        assert!(!pgs.is_text_subtitle_stream());
    }

    #[test]
    fn test_range_type_parse_and_range() {
        assert_eq!(VideoRangeType::parse("hdr10"), Some(VideoRangeType::Hdr10));
        assert_eq!(VideoRangeType::parse("DOVIWithSDR"), Some(VideoRangeType::DoViWithSdr));
        assert_eq!(VideoRangeType::parse("nonsense"), None);
        assert_eq!(VideoRangeType::Hlg.video_range(), VideoRange::Hdr);
        assert_eq!(VideoRangeType::DoViWithSdr.video_range(), VideoRange::Sdr);
    }

    #[test]
    fn test_streams_of_sorts_by_index() {
        let source = MediaSourceInfo {
            media_streams: vec![
                MediaStream {
                    index: 2,
                    stream_type: MediaStreamType::Audio,
                    ..Default::default()
                },
                MediaStream {
                    index: 0,
                    stream_type: MediaStreamType::Video,
                    ..Default::default()
                },
                MediaStream {
                    index: 1,
                    stream_type: MediaStreamType::Audio,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let audio: Vec<i32> = source
            .streams_of(MediaStreamType::Audio)
            .iter()
            .map(|s| s.index)
            .collect();
        assert_eq!(audio, vec![1, 2]);
    }

    #[test]
    fn test_container_is_handles_lists() {
        let source = MediaSourceInfo {
            container: Some("mov,mp4,m4a".to_string()),
            ..Default::default()
        };
        assert!(source.container_is("mp4"));
        assert!(!source.container_is("mkv"));
    }
}
