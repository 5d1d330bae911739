//! Client request parameters.
//!
//! Every segment request carries the complete negotiated request on its query
//! string, so parsing here must be total: unknown keys are ignored and values
//! that fail to parse are treated as unset.

use std::collections::BTreeMap;

use serde::Serialize;

/// How subtitles reach the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum SubtitleDeliveryMethod {
    /// Burned into the video
    Encode,
    /// Muxed into the output container
    Embed,
    /// Served as a separate file
    External,
    /// Served as an HLS subtitle rendition
    Hls,
    #[default]
    Drop,
}

impl SubtitleDeliveryMethod {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "encode" => Some(Self::Encode),
            "embed" => Some(Self::Embed),
            "external" => Some(Self::External),
            "hls" => Some(Self::Hls),
            "drop" => Some(Self::Drop),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Encode => "Encode",
            Self::Embed => "Embed",
            Self::External => "External",
            Self::Hls => "Hls",
            Self::Drop => "Drop",
        }
    }
}

/// Whether the client streams progressively or downloads a static file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum EncodingContext {
    #[default]
    Streaming,
    Static,
}

/// Client-supplied encoding request.
///
/// Codec fields may hold comma-separated preference lists (`"h264,hevc"`).
/// Per-codec free-form options live in `stream_options` keyed
/// `"<codec>-<name>"`, e.g. `"hevc-rangetype"`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaseEncodingJobOptions {
    pub device_id: Option<String>,
    pub play_session_id: Option<String>,
    pub media_source_id: Option<String>,
    pub live_stream_id: Option<String>,
    pub container: Option<String>,
    pub segment_container: Option<String>,
    pub segment_length: Option<u32>,
    pub min_segments: Option<u32>,
    pub is_static: bool,
    pub context: EncodingContext,

    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub subtitle_codec: Option<String>,
    pub video_stream_index: Option<i32>,
    pub audio_stream_index: Option<i32>,
    pub subtitle_stream_index: Option<i32>,
    pub subtitle_method: SubtitleDeliveryMethod,

    pub video_bit_rate: Option<u32>,
    pub audio_bit_rate: Option<u32>,
    pub audio_channels: Option<u32>,
    pub max_audio_channels: Option<u32>,
    pub transcoding_max_audio_channels: Option<u32>,
    pub audio_sample_rate: Option<u32>,
    pub max_audio_bit_depth: Option<u32>,

    pub width: Option<u32>,
    pub height: Option<u32>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub framerate: Option<f32>,
    pub max_framerate: Option<f32>,
    pub level: Option<String>,
    pub profile: Option<String>,
    pub max_ref_frames: Option<u32>,
    pub max_video_bit_depth: Option<u32>,

    pub require_avc: bool,
    pub require_non_anamorphic: bool,
    pub deinterlace: bool,
    pub copy_timestamps: bool,
    pub break_on_non_key_frames: bool,
    pub enable_auto_stream_copy: bool,
    pub allow_video_stream_copy: bool,
    pub allow_audio_stream_copy: bool,
    pub always_burn_in_subtitle_when_transcoding: bool,
    pub enable_adaptive_bitrate_streaming: bool,
    pub enable_subtitles_in_manifest: bool,

    pub start_time_ticks: Option<i64>,
    pub cpu_core_limit: Option<u32>,

    /// Start of the requested segment, carried on segment URLs
    pub current_runtime_ticks: Option<i64>,
    /// Exact length of the requested segment, carried on segment URLs
    pub actual_segment_length_ticks: Option<i64>,

    pub stream_options: BTreeMap<String, String>,
}

impl Default for BaseEncodingJobOptions {
    fn default() -> Self {
        Self {
            device_id: None,
            play_session_id: None,
            media_source_id: None,
            live_stream_id: None,
            container: None,
            segment_container: None,
            segment_length: None,
            min_segments: None,
            is_static: false,
            context: EncodingContext::Streaming,
            video_codec: None,
            audio_codec: None,
            subtitle_codec: None,
            video_stream_index: None,
            audio_stream_index: None,
            subtitle_stream_index: None,
            subtitle_method: SubtitleDeliveryMethod::Drop,
            video_bit_rate: None,
            audio_bit_rate: None,
            audio_channels: None,
            max_audio_channels: None,
            transcoding_max_audio_channels: None,
            audio_sample_rate: None,
            max_audio_bit_depth: None,
            width: None,
            height: None,
            max_width: None,
            max_height: None,
            framerate: None,
            max_framerate: None,
            level: None,
            profile: None,
            max_ref_frames: None,
            max_video_bit_depth: None,
            require_avc: false,
            require_non_anamorphic: false,
            deinterlace: false,
            copy_timestamps: false,
            break_on_non_key_frames: false,
            enable_auto_stream_copy: true,
            allow_video_stream_copy: true,
            allow_audio_stream_copy: true,
            always_burn_in_subtitle_when_transcoding: false,
            enable_adaptive_bitrate_streaming: true,
            enable_subtitles_in_manifest: false,
            start_time_ticks: None,
            cpu_core_limit: None,
            current_runtime_ticks: None,
            actual_segment_length_ticks: None,
            stream_options: BTreeMap::new(),
        }
    }
}

const STREAM_OPTIONS_PREFIX: &str = "streamOptions.";

impl BaseEncodingJobOptions {
    /// Builds options from decoded query pairs. Keys match case-insensitively.
    pub fn from_query_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = Self::default();
        for (key, value) in pairs {
            options.apply(key.as_ref(), value.as_ref());
        }
        options
    }

    /// Parses a raw (still percent-encoded) query string, with or without `?`.
    pub fn from_query_string(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        Self::from_query_pairs(url::form_urlencoded::parse(query.as_bytes()))
    }

    fn apply(&mut self, key: &str, value: &str) {
        if let Some(option) = key.strip_prefix(STREAM_OPTIONS_PREFIX) {
            if !option.is_empty() {
                self.stream_options
                    .insert(option.to_ascii_lowercase(), value.to_string());
            }
            return;
        }

        match key.to_ascii_lowercase().as_str() {
            "deviceid" => self.device_id = non_empty(value),
            "playsessionid" => self.play_session_id = non_empty(value),
            "mediasourceid" => self.media_source_id = non_empty(value),
            "livestreamid" => self.live_stream_id = non_empty(value),
            "container" => self.container = non_empty(value),
            "segmentcontainer" => self.segment_container = non_empty(value),
            "segmentlength" => self.segment_length = parse_positive(value),
            "minsegments" => self.min_segments = parse_positive(value),
            "static" => self.is_static = parse_bool(value).unwrap_or(false),
            "context" => {
                self.context = if value.eq_ignore_ascii_case("static") {
                    EncodingContext::Static
                } else {
                    EncodingContext::Streaming
                }
            }
            "videocodec" => self.video_codec = non_empty(value),
            "audiocodec" => self.audio_codec = non_empty(value),
            "subtitlecodec" => self.subtitle_codec = non_empty(value),
            "videostreamindex" => self.video_stream_index = value.trim().parse().ok(),
            "audiostreamindex" => self.audio_stream_index = value.trim().parse().ok(),
            "subtitlestreamindex" => self.subtitle_stream_index = value.trim().parse().ok(),
            "subtitlemethod" => {
                self.subtitle_method = SubtitleDeliveryMethod::parse(value).unwrap_or_default()
            }
            "videobitrate" => self.video_bit_rate = parse_positive(value),
            "audiobitrate" => self.audio_bit_rate = parse_positive(value),
            "audiochannels" => self.audio_channels = parse_positive(value),
            "maxaudiochannels" => self.max_audio_channels = parse_positive(value),
            "transcodingmaxaudiochannels" => {
                self.transcoding_max_audio_channels = parse_positive(value)
            }
            "audiosamplerate" => self.audio_sample_rate = parse_positive(value),
            "maxaudiobitdepth" => self.max_audio_bit_depth = parse_positive(value),
            "width" => self.width = parse_positive(value),
            "height" => self.height = parse_positive(value),
            "maxwidth" => self.max_width = parse_positive(value),
            "maxheight" => self.max_height = parse_positive(value),
            "framerate" => self.framerate = parse_positive_float(value),
            "maxframerate" => self.max_framerate = parse_positive_float(value),
            "level" => self.level = non_empty(value),
            "profile" => self.profile = non_empty(value),
            "maxrefframes" => self.max_ref_frames = parse_positive(value),
            "maxvideobitdepth" => self.max_video_bit_depth = parse_positive(value),
            "requireavc" => self.require_avc = parse_bool(value).unwrap_or(false),
            "requirenonanamorphic" => {
                self.require_non_anamorphic = parse_bool(value).unwrap_or(false)
            }
            "deinterlace" => self.deinterlace = parse_bool(value).unwrap_or(false),
            "copytimestamps" => self.copy_timestamps = parse_bool(value).unwrap_or(false),
            "breakonnonkeyframes" => {
                self.break_on_non_key_frames = parse_bool(value).unwrap_or(false)
            }
            "enableautostreamcopy" => {
                self.enable_auto_stream_copy = parse_bool(value).unwrap_or(true)
            }
            "allowvideostreamcopy" => {
                self.allow_video_stream_copy = parse_bool(value).unwrap_or(true)
            }
            "allowaudiostreamcopy" => {
                self.allow_audio_stream_copy = parse_bool(value).unwrap_or(true)
            }
            "alwaysburninsubtitlewhentranscoding" => {
                self.always_burn_in_subtitle_when_transcoding = parse_bool(value).unwrap_or(false)
            }
            "enableadaptivebitratestreaming" => {
                self.enable_adaptive_bitrate_streaming = parse_bool(value).unwrap_or(true)
            }
            "enablesubtitlesinmanifest" => {
                self.enable_subtitles_in_manifest = parse_bool(value).unwrap_or(false)
            }
            "starttimeticks" => self.start_time_ticks = parse_non_negative_ticks(value),
            "cpucorelimit" => self.cpu_core_limit = parse_positive(value),
            "runtimeticks" => self.current_runtime_ticks = parse_non_negative_ticks(value),
            "actualsegmentlengthticks" => {
                self.actual_segment_length_ticks = parse_non_negative_ticks(value)
            }
            _ => {
                // `h264-profile=high` style keys are per-codec options
                if key.contains('-') && key.starts_with(|c: char| c.is_ascii_lowercase()) {
                    self.stream_options
                        .insert(key.to_ascii_lowercase(), value.to_string());
                }
            }
        }
    }

    /// Canonical query pairs for every field that differs from the default.
    ///
    /// Segment-position fields are left out; playlist generation appends them
    /// per segment.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let defaults = Self::default();
        let mut pairs: Vec<(String, String)> = Vec::new();
        let mut push = |key: &str, value: String| pairs.push((key.to_string(), value));

        macro_rules! opt {
            ($key:literal, $field:expr) => {
                if let Some(value) = &$field {
                    push($key, value.to_string());
                }
            };
        }
        macro_rules! flag {
            ($key:literal, $field:ident) => {
                if self.$field != defaults.$field {
                    push($key, self.$field.to_string());
                }
            };
        }

        opt!("DeviceId", self.device_id);
        opt!("PlaySessionId", self.play_session_id);
        opt!("MediaSourceId", self.media_source_id);
        opt!("LiveStreamId", self.live_stream_id);
        opt!("Container", self.container);
        opt!("SegmentContainer", self.segment_container);
        opt!("SegmentLength", self.segment_length);
        opt!("MinSegments", self.min_segments);
        flag!("Static", is_static);
        if self.context == EncodingContext::Static {
            push("Context", "Static".to_string());
        }
        opt!("VideoCodec", self.video_codec);
        opt!("AudioCodec", self.audio_codec);
        opt!("SubtitleCodec", self.subtitle_codec);
        opt!("VideoStreamIndex", self.video_stream_index);
        opt!("AudioStreamIndex", self.audio_stream_index);
        opt!("SubtitleStreamIndex", self.subtitle_stream_index);
        if self.subtitle_method != SubtitleDeliveryMethod::Drop {
            push("SubtitleMethod", self.subtitle_method.as_str().to_string());
        }
        opt!("VideoBitrate", self.video_bit_rate);
        opt!("AudioBitrate", self.audio_bit_rate);
        opt!("AudioChannels", self.audio_channels);
        opt!("MaxAudioChannels", self.max_audio_channels);
        opt!("TranscodingMaxAudioChannels", self.transcoding_max_audio_channels);
        opt!("AudioSampleRate", self.audio_sample_rate);
        opt!("MaxAudioBitDepth", self.max_audio_bit_depth);
        opt!("Width", self.width);
        opt!("Height", self.height);
        opt!("MaxWidth", self.max_width);
        opt!("MaxHeight", self.max_height);
        opt!("Framerate", self.framerate);
        opt!("MaxFramerate", self.max_framerate);
        opt!("Level", self.level);
        opt!("Profile", self.profile);
        opt!("MaxRefFrames", self.max_ref_frames);
        opt!("MaxVideoBitDepth", self.max_video_bit_depth);
        flag!("RequireAvc", require_avc);
        flag!("RequireNonAnamorphic", require_non_anamorphic);
        flag!("DeInterlace", deinterlace);
        flag!("CopyTimestamps", copy_timestamps);
        flag!("BreakOnNonKeyFrames", break_on_non_key_frames);
        flag!("EnableAutoStreamCopy", enable_auto_stream_copy);
        flag!("AllowVideoStreamCopy", allow_video_stream_copy);
        flag!("AllowAudioStreamCopy", allow_audio_stream_copy);
        flag!(
            "AlwaysBurnInSubtitleWhenTranscoding",
            always_burn_in_subtitle_when_transcoding
        );
        flag!(
            "EnableAdaptiveBitrateStreaming",
            enable_adaptive_bitrate_streaming
        );
        flag!("EnableSubtitlesInManifest", enable_subtitles_in_manifest);
        opt!("StartTimeTicks", self.start_time_ticks);
        opt!("CpuCoreLimit", self.cpu_core_limit);

        for (key, value) in &self.stream_options {
            push(&format!("{STREAM_OPTIONS_PREFIX}{key}"), value.clone());
        }

        pairs
    }

    /// Serializes [`Self::to_query_pairs`] as `?k=v&...`, or an empty string.
    pub fn to_query_string(&self) -> String {
        let pairs = self.to_query_pairs();
        if pairs.is_empty() {
            return String::new();
        }
        let mut serializer = url::form_urlencoded::Serializer::new(String::from("?"));
        serializer.extend_pairs(pairs);
        serializer.finish()
    }

    /// Looks up `"<qualifier>-<name>"`, falling back to the bare `name`.
    pub fn option(&self, qualifier: &str, name: &str) -> Option<&str> {
        let qualified = format!(
            "{}-{}",
            qualifier.to_ascii_lowercase(),
            name.to_ascii_lowercase()
        );
        self.stream_options
            .get(&qualified)
            .or_else(|| self.stream_options.get(&name.to_ascii_lowercase()))
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Option lookup that also tries the other spelling of HEVC.
    fn codec_option(&self, codec: &str, name: &str) -> Option<&str> {
        self.option(codec, name).or_else(|| match codec {
            "hevc" => self.option("h265", name),
            "h265" => self.option("hevc", name),
            _ => None,
        })
    }

    /// Requested video codecs, lowercased, in preference order.
    pub fn video_codecs(&self) -> Vec<String> {
        split_list(self.video_codec.as_deref())
    }

    /// Requested audio codecs, lowercased, in preference order.
    pub fn audio_codecs(&self) -> Vec<String> {
        split_list(self.audio_codec.as_deref())
    }

    pub fn subtitle_codecs(&self) -> Vec<String> {
        split_list(self.subtitle_codec.as_deref())
    }

    /// Profiles the client accepts for `codec`, spaces removed.
    pub fn requested_profiles(&self, codec: &str) -> Vec<String> {
        let source = self
            .profile
            .as_deref()
            .or_else(|| self.codec_option(codec, "profile"));
        source
            .map(|profiles| {
                profiles
                    .split(['|', ','])
                    .map(|p| p.replace(' ', ""))
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn requested_range_types(&self, codec: &str) -> Vec<String> {
        self.codec_option(codec, "rangetype")
            .map(|ranges| {
                ranges
                    .split(['|', ','])
                    .map(|r| r.trim().to_string())
                    .filter(|r| !r.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Requested level as a number, e.g. 41 or 150.
    pub fn requested_level(&self, codec: &str) -> Option<f64> {
        self.level
            .as_deref()
            .or_else(|| self.codec_option(codec, "level"))
            .and_then(|level| level.trim().parse().ok())
    }

    pub fn requested_max_ref_frames(&self, codec: &str) -> Option<u32> {
        self.max_ref_frames.or_else(|| {
            self.codec_option(codec, "maxrefframes")
                .and_then(|v| v.trim().parse().ok())
        })
    }

    pub fn requested_video_bit_depth(&self, codec: &str) -> Option<u32> {
        self.max_video_bit_depth.or_else(|| {
            self.codec_option(codec, "videobitdepth")
                .and_then(|v| v.trim().parse().ok())
        })
    }

    pub fn requested_audio_bit_depth(&self, codec: &str) -> Option<u32> {
        self.max_audio_bit_depth.or_else(|| {
            self.codec_option(codec, "audiobitdepth")
                .and_then(|v| v.trim().parse().ok())
        })
    }

    /// Channel ceiling for `codec`: the per-codec option wins over global fields.
    pub fn requested_audio_channels(&self, codec: &str) -> Option<u32> {
        self.codec_option(codec, "audiochannels")
            .and_then(|v| v.trim().parse().ok())
            .filter(|channels: &u32| *channels > 0)
            .or(self.max_audio_channels)
            .or(self.audio_channels)
            .or(self.transcoding_max_audio_channels)
    }

    /// Whether the client asked for deinterlacing of `codec` specifically.
    pub fn requested_deinterlace(&self, codec: &str) -> bool {
        self.deinterlace
            || self
                .codec_option(codec, "deinterlace")
                .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn parse_positive(value: &str) -> Option<u32> {
    value.trim().parse::<u32>().ok().filter(|v| *v > 0)
}

fn parse_positive_float(value: &str) -> Option<f32> {
    value
        .trim()
        .parse::<f32>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0)
}

fn parse_non_negative_ticks(value: &str) -> Option<i64> {
    value.trim().parse::<i64>().ok().filter(|v| *v >= 0)
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|list| {
            list.split(',')
                .map(|item| item.trim().to_ascii_lowercase())
                .filter(|item| !item.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        let options = BaseEncodingJobOptions::from_query_string(
            "?videoCodec=h264,HEVC&AUDIOCODEC=aac&VideoBitrate=4000000&MaxWidth=1920&PlaySessionId=abc",
        );
        assert_eq!(options.video_codecs(), vec!["h264", "hevc"]);
        assert_eq!(options.audio_codecs(), vec!["aac"]);
        assert_eq!(options.video_bit_rate, Some(4_000_000));
        assert_eq!(options.max_width, Some(1920));
        assert_eq!(options.play_session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_unparseable_values_are_unset() {
        let options = BaseEncodingJobOptions::from_query_string(
            "VideoBitrate=lots&RequireAvc=maybe&AllowVideoStreamCopy=perhaps&StartTimeTicks=-5",
        );
        assert_eq!(options.video_bit_rate, None);
        assert!(!options.require_avc);
        assert!(options.allow_video_stream_copy);
        assert_eq!(options.start_time_ticks, None);
    }

    #[test]
    fn test_codec_options() {
        let options = BaseEncodingJobOptions::from_query_string(
            "h264-profile=high,main&hevc-rangetype=SDR|HDR10&streamOptions.h265-level=150&audiochannels=6",
        );
        assert_eq!(options.requested_profiles("h264"), vec!["high", "main"]);
        assert_eq!(options.requested_range_types("hevc"), vec!["SDR", "HDR10"]);
        assert_eq!(options.requested_level("hevc"), Some(150.0));
        assert_eq!(options.requested_level("h264"), None);
        // No per-codec value, so the global field applies
        assert_eq!(options.requested_audio_channels("aac"), Some(6));
    }

    #[test]
    fn test_global_profile_wins_over_codec_option() {
        let options =
            BaseEncodingJobOptions::from_query_string("Profile=Main 10&hevc-profile=main");
        assert_eq!(options.requested_profiles("hevc"), vec!["Main10"]);
    }

    #[test]
    fn test_query_roundtrip_preserves_negotiation_inputs() {
        let original = BaseEncodingJobOptions::from_query_string(
            "DeviceId=dev&PlaySessionId=ps&VideoCodec=h264&AudioCodec=aac&VideoBitrate=3000000\
             &SegmentContainer=mp4&AllowVideoStreamCopy=false&SubtitleMethod=Hls&h264-level=41",
        );
        let reparsed = BaseEncodingJobOptions::from_query_string(&original.to_query_string());
        assert_eq!(original, reparsed);
    }

    #[test]
    fn test_segment_position_fields() {
        let options = BaseEncodingJobOptions::from_query_string(
            "runtimeTicks=50000000&actualSegmentLengthTicks=30000000",
        );
        assert_eq!(options.current_runtime_ticks, Some(50_000_000));
        assert_eq!(options.actual_segment_length_ticks, Some(30_000_000));
        assert!(options.to_query_pairs().is_empty());
    }
}
