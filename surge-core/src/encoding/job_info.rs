//! The negotiated plan for one request.

use serde::Serialize;

use crate::encoding::hwaccel::HardwareAccelerationType;
use crate::encoding::options::{BaseEncodingJobOptions, SubtitleDeliveryMethod};
use crate::encoding::resolution::resize_within;
use crate::encoding::{is_copy_codec, segment_file_extension};
use crate::media::{MediaProtocol, MediaSourceInfo, MediaStream, VideoRangeType};

/// Output packaging of a transcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum TranscodingJobType {
    /// One continuous output file streamed as it grows
    Progressive,
    #[default]
    Hls,
    Dash,
}

impl TranscodingJobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progressive => "progressive",
            Self::Hls => "hls",
            Self::Dash => "dash",
        }
    }
}

/// Everything negotiation decided about one request.
///
/// Filled in by [`crate::encoding::negotiate`] and read-only afterwards.
#[derive(Debug, Clone)]
pub struct EncodingJobInfo {
    /// Request options after negotiation rewrote codec lists and ceilings
    pub base_request: BaseEncodingJobOptions,
    /// Request options as the client sent them; URLs handed back carry these
    pub client_request: BaseEncodingJobOptions,
    pub transcoding_type: TranscodingJobType,
    pub is_video_request: bool,

    pub media_source: Option<MediaSourceInfo>,
    pub media_path: String,
    pub input_protocol: MediaProtocol,
    pub input_container: Option<String>,
    pub run_time_ticks: Option<i64>,
    pub read_input_at_native_framerate: bool,
    pub input_video_sync: Option<String>,
    pub input_audio_sync: Option<String>,

    pub video_stream: Option<MediaStream>,
    pub audio_stream: Option<MediaStream>,
    pub subtitle_stream: Option<MediaStream>,
    pub subtitle_delivery_method: SubtitleDeliveryMethod,

    /// Candidate codecs in preference order after shifting
    pub supported_video_codecs: Vec<String>,
    pub supported_audio_codecs: Vec<String>,

    pub output_container: Option<String>,
    pub segment_container: String,
    pub output_video_codec: Option<String>,
    pub output_audio_codec: Option<String>,
    pub output_video_bitrate: Option<u32>,
    pub output_audio_bitrate: Option<u32>,
    pub output_audio_channels: Option<u32>,
    pub output_audio_sample_rate: Option<u32>,

    pub hw_backend: HardwareAccelerationType,
    /// Whether the source is decoded on the hardware backend
    pub hardware_decoding: bool,
    pub video_encoder: Option<String>,
    pub audio_encoder: Option<String>,
}

impl EncodingJobInfo {
    pub fn new(base_request: BaseEncodingJobOptions, transcoding_type: TranscodingJobType) -> Self {
        Self {
            client_request: base_request.clone(),
            base_request,
            transcoding_type,
            is_video_request: true,
            media_source: None,
            media_path: String::new(),
            input_protocol: MediaProtocol::File,
            input_container: None,
            run_time_ticks: None,
            read_input_at_native_framerate: false,
            input_video_sync: None,
            input_audio_sync: None,
            video_stream: None,
            audio_stream: None,
            subtitle_stream: None,
            subtitle_delivery_method: SubtitleDeliveryMethod::Drop,
            supported_video_codecs: Vec::new(),
            supported_audio_codecs: Vec::new(),
            output_container: None,
            segment_container: "ts".to_string(),
            output_video_codec: None,
            output_audio_codec: None,
            output_video_bitrate: None,
            output_audio_bitrate: None,
            output_audio_channels: None,
            output_audio_sample_rate: None,
            hw_backend: HardwareAccelerationType::None,
            hardware_decoding: false,
            video_encoder: None,
            audio_encoder: None,
        }
    }

    /// Query string for playlist and segment URLs.
    ///
    /// Built from the client's request so the next request negotiates the
    /// same plan again.
    pub fn url_query(&self) -> String {
        self.client_request.to_query_string()
    }

    pub fn is_video_copy(&self) -> bool {
        is_copy_codec(self.output_video_codec.as_deref())
    }

    pub fn is_audio_copy(&self) -> bool {
        is_copy_codec(self.output_audio_codec.as_deref())
    }

    pub fn is_fmp4(&self) -> bool {
        segment_file_extension(&self.segment_container) == ".mp4"
    }

    pub fn segment_extension(&self) -> &'static str {
        segment_file_extension(&self.segment_container)
    }

    /// Live source packaged into segments.
    pub fn is_segmented_live_stream(&self) -> bool {
        self.transcoding_type != TranscodingJobType::Progressive
            && self
                .media_source
                .as_ref()
                .is_some_and(|source| source.is_infinite_stream)
    }

    /// Codec the client will actually receive, resolving `copy` to the source codec.
    pub fn actual_output_video_codec(&self) -> Option<String> {
        if self.is_video_copy() {
            self.video_stream.as_ref().and_then(|s| s.codec.clone())
        } else {
            self.output_video_codec.clone()
        }
    }

    pub fn actual_output_audio_codec(&self) -> Option<String> {
        if self.is_audio_copy() {
            self.audio_stream.as_ref().and_then(|s| s.codec.clone())
        } else {
            self.output_audio_codec.clone()
        }
    }

    /// Whether the source needs deinterlacing for `codec`.
    ///
    /// `force_if_interlaced` makes any interlaced source qualify, which is
    /// what the filter chain wants when re-encoding anyway.
    pub fn deinterlace(&self, codec: &str, force_if_interlaced: bool) -> bool {
        let interlaced = self.video_stream.as_ref().is_some_and(|s| s.is_interlaced);
        if !interlaced {
            return false;
        }
        self.base_request.requested_deinterlace(codec) || force_if_interlaced
    }

    /// Output width after resolution ceilings are applied.
    pub fn output_width(&self) -> Option<u32> {
        self.output_size().map(|(w, _)| w)
    }

    pub fn output_height(&self) -> Option<u32> {
        self.output_size().map(|(_, h)| h)
    }

    fn output_size(&self) -> Option<(u32, u32)> {
        let request = &self.base_request;
        match self.video_stream.as_ref().and_then(|s| s.width.zip(s.height)) {
            Some(source) if self.is_video_copy() => Some(source),
            Some(source) => Some(resize_within(
                source,
                request.width,
                request.height,
                request.max_width,
                request.max_height,
            )),
            None => request.width.zip(request.height),
        }
    }

    /// Frame rate the output will have.
    pub fn target_framerate(&self) -> Option<f32> {
        if self.base_request.is_static || self.is_video_copy() {
            return self.video_stream.as_ref().and_then(|s| s.reference_frame_rate());
        }
        let request = &self.base_request;
        let source = self.video_stream.as_ref().and_then(|s| s.reference_frame_rate());
        match (request.framerate.or(request.max_framerate), source) {
            (Some(requested), Some(source)) => Some(requested.min(source)),
            (requested, source) => requested.or(source),
        }
    }

    pub fn target_video_bit_depth(&self) -> Option<u32> {
        if self.is_video_copy() {
            self.video_stream.as_ref().and_then(|s| s.bit_depth)
        } else {
            None
        }
    }

    /// Codec level of the output, e.g. 41 or 150.
    pub fn target_video_level(&self) -> Option<f64> {
        if self.is_video_copy() {
            return self.video_stream.as_ref().and_then(|s| s.level);
        }
        let codec = self.actual_output_video_codec()?;
        self.base_request.requested_level(&codec)
    }

    pub fn target_video_profile(&self) -> Option<String> {
        if self.is_video_copy() {
            return self.video_stream.as_ref().and_then(|s| s.profile.clone());
        }
        let codec = self.actual_output_video_codec()?;
        self.base_request.requested_profiles(&codec).into_iter().next()
    }

    /// Dynamic range of the output; re-encodes are tone mapped or already SDR.
    pub fn target_video_range_type(&self) -> VideoRangeType {
        match &self.video_stream {
            Some(stream) if self.is_video_copy() => stream.video_range_type,
            Some(_) => VideoRangeType::Sdr,
            None => VideoRangeType::Unknown,
        }
    }

    /// Position of `stream` among the streams of the same input file.
    ///
    /// This is the index ffmpeg uses in `-map <input>:<index>`.
    pub fn ffmpeg_stream_index(&self, stream: &MediaStream) -> Option<usize> {
        let source = self.media_source.as_ref()?;
        source
            .media_streams
            .iter()
            .filter(|candidate| {
                candidate.is_external == stream.is_external && candidate.path == stream.path
            })
            .position(|candidate| candidate == stream)
    }

    /// Whether the selected subtitle is burned in with a graphical overlay.
    pub fn has_graphical_subtitle_burn_in(&self) -> bool {
        self.subtitle_delivery_method == SubtitleDeliveryMethod::Encode
            && self
                .subtitle_stream
                .as_ref()
                .is_some_and(|s| !s.is_text_subtitle_stream())
    }

    pub fn has_text_subtitle_burn_in(&self) -> bool {
        self.subtitle_delivery_method == SubtitleDeliveryMethod::Encode
            && self
                .subtitle_stream
                .as_ref()
                .is_some_and(MediaStream::is_text_subtitle_stream)
    }

    /// External graphical subtitles are fed to ffmpeg as a second input.
    pub fn has_external_graphical_subtitle_input(&self) -> bool {
        self.has_graphical_subtitle_burn_in()
            && self.subtitle_stream.as_ref().is_some_and(|s| s.is_external)
    }

    pub fn has_external_audio_input(&self) -> bool {
        self.audio_stream
            .as_ref()
            .is_some_and(|s| s.is_external && s.path.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaStreamType;

    fn job_with_video(codec: &str) -> EncodingJobInfo {
        let mut job = EncodingJobInfo::new(BaseEncodingJobOptions::default(), TranscodingJobType::Hls);
        job.video_stream = Some(MediaStream {
            index: 0,
            codec: Some("hevc".to_string()),
            width: Some(3840),
            height: Some(2160),
            level: Some(153.0),
            real_frame_rate: Some(23.976),
            video_range_type: VideoRangeType::Hdr10,
            ..Default::default()
        });
        job.output_video_codec = Some(codec.to_string());
        job
    }

    #[test]
    fn test_copy_reports_source_properties() {
        let job = job_with_video("copy");
        assert_eq!(job.actual_output_video_codec().as_deref(), Some("hevc"));
        assert_eq!(job.target_video_level(), Some(153.0));
        assert_eq!(job.target_video_range_type(), VideoRangeType::Hdr10);
        assert_eq!(job.output_width(), Some(3840));
    }

    #[test]
    fn test_transcode_applies_ceilings() {
        let mut job = job_with_video("h264");
        job.base_request.max_width = Some(1920);
        job.base_request.max_framerate = Some(60.0);
        assert_eq!(job.output_width(), Some(1920));
        assert_eq!(job.output_height(), Some(1080));
        assert_eq!(job.target_video_range_type(), VideoRangeType::Sdr);
        assert_eq!(job.target_framerate(), Some(23.976));
        assert_eq!(job.target_video_level(), None);
    }

    #[test]
    fn test_ffmpeg_stream_index_skips_external_streams() {
        let streams = vec![
            MediaStream {
                index: 0,
                stream_type: MediaStreamType::Video,
                ..Default::default()
            },
            MediaStream {
                index: 1,
                stream_type: MediaStreamType::Subtitle,
                is_external: true,
                path: Some("/media/movie.en.srt".to_string()),
                ..Default::default()
            },
            MediaStream {
                index: 2,
                stream_type: MediaStreamType::Audio,
                ..Default::default()
            },
        ];
        let mut job = EncodingJobInfo::new(BaseEncodingJobOptions::default(), TranscodingJobType::Hls);
        job.media_source = Some(MediaSourceInfo {
            media_streams: streams.clone(),
            ..Default::default()
        });
        assert_eq!(job.ffmpeg_stream_index(&streams[2]), Some(1));
        assert_eq!(job.ffmpeg_stream_index(&streams[1]), Some(0));
    }
}
