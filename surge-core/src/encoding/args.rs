//! ffmpeg command-line assembly.
//!
//! [`CommandLineBuilder`] turns a negotiated [`EncodingJobInfo`] into the
//! argument vector handed to the transcoder. Arguments are never joined into a
//! shell string; [`FfmpegArgs`]'s `Display` quoting is for logs only.

use std::fmt;
use std::path::Path;

use crate::config::EncodingOptions;
use crate::encoding::bitrate::audio_encoder_for;
use crate::encoding::filters::{build_filter_chain, can_use_zero_copy};
use crate::encoding::hwaccel::{
    HardwareAccelerationType, HardwareCapabilities, Platform, backend_of_encoder,
    hw_decoder_args, hw_device_init_args,
};
use crate::encoding::job_info::{EncodingJobInfo, TranscodingJobType};
use crate::encoding::normalize_codec;
use crate::encoding::options::SubtitleDeliveryMethod;
use crate::media::{MediaProtocol, MediaStream, VideoRangeType};
use crate::ticks::{format_ffmpeg_time, ticks_to_seconds};

/// Ordered ffmpeg arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FfmpegArgs(Vec<String>);

impl FfmpegArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, arg: impl Into<String>) {
        self.0.push(arg.into());
    }

    pub fn extend<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0.extend(args.into_iter().map(Into::into));
    }

    pub fn append(&mut self, mut other: FfmpegArgs) {
        self.0.append(&mut other.0);
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value following the first occurrence of `flag`.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.0
            .iter()
            .position(|arg| arg == flag)
            .and_then(|i| self.0.get(i + 1))
            .map(String::as_str)
    }

    pub fn contains(&self, arg: &str) -> bool {
        self.0.iter().any(|a| a == arg)
    }
}

impl fmt::Display for FfmpegArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if arg.is_empty() || arg.contains([' ', '"', ';']) {
                write!(f, "\"{}\"", arg.replace('"', "\\\""))?;
            } else {
                f.write_str(arg)?;
            }
        }
        Ok(())
    }
}

impl From<Vec<String>> for FfmpegArgs {
    fn from(args: Vec<String>) -> Self {
        Self(args)
    }
}

/// Builds ffmpeg arguments for one negotiated job.
#[derive(Debug, Clone, Copy)]
pub struct CommandLineBuilder<'a> {
    pub job: &'a EncodingJobInfo,
    pub options: &'a EncodingOptions,
    pub capabilities: &'a HardwareCapabilities,
    pub platform: Platform,
}

impl<'a> CommandLineBuilder<'a> {
    pub fn new(
        job: &'a EncodingJobInfo,
        options: &'a EncodingOptions,
        capabilities: &'a HardwareCapabilities,
        platform: Platform,
    ) -> Self {
        Self {
            job,
            options,
            capabilities,
            platform,
        }
    }

    fn transcodes_video(&self) -> bool {
        self.job.video_stream.is_some()
            && self.job.output_video_codec.is_some()
            && !self.job.is_video_copy()
    }

    /// Input modifiers, hardware device setup and every `-i`.
    pub fn input_args(&self) -> FfmpegArgs {
        let job = self.job;
        let request = &job.base_request;
        let source = job.media_source.as_ref();
        let mut args = FfmpegArgs::new();

        if let Some(analyze_ms) = source.and_then(|s| s.analyze_duration_ms) {
            args.extend(["-analyzeduration".to_string(), (analyze_ms as u64 * 1000).to_string()]);
        }
        if job.is_segmented_live_stream() {
            args.extend(["-probesize", "1G"]);
        }

        let mut fflags = String::new();
        if source.is_some_and(|s| s.gen_pts_input) {
            fflags.push_str("+genpts");
        }
        if source.is_some_and(|s| s.ignore_dts) {
            fflags.push_str("+igndts");
        }
        if source.is_some_and(|s| s.ignore_index) {
            fflags.push_str("+ignidx");
        }
        if !fflags.is_empty() {
            args.extend(["-fflags".to_string(), fflags]);
        }

        if job.read_input_at_native_framerate {
            args.push("-re");
        }

        if let Some(start) = request.start_time_ticks.filter(|ticks| *ticks > 0) {
            args.extend(["-ss".to_string(), format_ffmpeg_time(start)]);
            // Copies cut at the previous keyframe; accurate seek would drop the leading GOP
            if job.transcoding_type == TranscodingJobType::Hls && job.is_video_copy() {
                args.push("-noaccurate_seek");
            }
        }

        if job.input_protocol == MediaProtocol::Http {
            if let Some(source) = source {
                let mut headers = String::new();
                for (name, value) in &source.required_http_headers {
                    if name.eq_ignore_ascii_case("user-agent") {
                        args.extend(["-user_agent".to_string(), value.clone()]);
                    } else {
                        headers.push_str(&format!("{name}: {value}\r\n"));
                    }
                }
                if !headers.is_empty() {
                    args.extend(["-headers".to_string(), headers]);
                }
            }
        }

        if let Some(sync) = job.input_audio_sync.as_deref() {
            args.extend(["-async", sync]);
        }
        if let Some(sync) = job.input_video_sync.as_deref() {
            let mode = if sync == "-1" { "passthrough" } else { sync };
            args.extend(["-fps_mode", mode]);
        }

        if self.transcodes_video() && job.hw_backend != HardwareAccelerationType::None {
            args.extend(hw_device_init_args(job.hw_backend, self.options, self.platform));
            if job.hardware_decoding {
                let keep_on_device = can_use_zero_copy(job, self.options, self.capabilities);
                args.extend(hw_decoder_args(job.hw_backend, keep_on_device));
            }
        }

        args.extend(["-i", job.media_path.as_str()]);

        if job.has_external_graphical_subtitle_input() {
            if let Some(path) = job.subtitle_stream.as_ref().and_then(|s| s.path.as_deref()) {
                args.extend(["-i", path]);
            }
        }
        if job.has_external_audio_input() {
            if let Some(path) = job.audio_stream.as_ref().and_then(|s| s.path.as_deref()) {
                args.extend(["-i", path]);
            }
        }

        args
    }

    /// Input-relative index of `stream` for `-map`.
    fn map_index(&self, stream: &MediaStream) -> usize {
        self.job
            .ffmpeg_stream_index(stream)
            .unwrap_or_else(|| stream.index.max(0) as usize)
    }

    /// `-map` selection mirroring the chosen streams.
    pub fn map_args(&self) -> FfmpegArgs {
        let job = self.job;
        let mut args = FfmpegArgs::new();

        match job.video_stream.as_ref() {
            Some(video) if job.is_video_request => {
                args.extend(["-map".to_string(), format!("0:{}", self.map_index(video))]);
            }
            _ => args.push("-vn"),
        }

        if job.has_external_audio_input() {
            let input = if job.has_external_graphical_subtitle_input() { 2 } else { 1 };
            args.extend(["-map".to_string(), format!("{input}:0")]);
        } else if let Some(audio) = job.audio_stream.as_ref() {
            args.extend(["-map".to_string(), format!("0:{}", self.map_index(audio))]);
        } else {
            args.extend(["-map", "-0:a"]);
        }

        match (job.subtitle_stream.as_ref(), job.subtitle_delivery_method) {
            (Some(subtitle), SubtitleDeliveryMethod::Embed) if !subtitle.is_external => {
                args.extend(["-map".to_string(), format!("0:{}", self.map_index(subtitle))]);
            }
            // Burned-in subtitles are consumed by the filter graph
            (Some(_), SubtitleDeliveryMethod::Encode) => args.push("-sn"),
            _ => args.extend(["-map", "-0:s"]),
        }

        args
    }

    /// Encoder, quality, keyframe and filter arguments for the video stream.
    pub fn video_args(&self, segment_length: u32) -> FfmpegArgs {
        let job = self.job;
        let mut args = FfmpegArgs::new();
        let (Some(stream), Some(codec)) = (job.video_stream.as_ref(), job.output_video_codec.as_deref())
        else {
            return args;
        };
        if !job.is_video_request {
            return args;
        }

        let encoder = if job.is_video_copy() {
            "copy".to_string()
        } else {
            job.video_encoder.clone().unwrap_or_else(|| codec.to_string())
        };
        args.extend(["-codec:v:0", encoder.as_str()]);

        let output_codec = job.actual_output_video_codec().map(|c| normalize_codec(&c));
        if job.is_fmp4() && output_codec.as_deref() == Some("hevc") {
            args.extend(["-tag:v:0", "hvc1"]);
        }

        if job.is_video_copy() {
            args.extend(video_bitstream_filter_args(job, stream));
            args.push("-start_at_zero");
            return args;
        }

        if let Some(preset) = encoder_preset(&encoder, &self.options.encoder_preset) {
            args.extend(["-preset".to_string(), preset]);
        }
        match encoder.as_str() {
            "libx264" => args.extend(["-crf".to_string(), self.options.h264_crf.to_string()]),
            "libx265" => {
                args.extend(["-crf".to_string(), self.options.h265_crf.to_string()]);
                args.extend(["-x265-params:0", "no-info=1"]);
            }
            _ => {}
        }

        if let Some(bitrate) = job.output_video_bitrate {
            args.extend(video_bitrate_args(&encoder, bitrate));
        }

        if let Some(profile) = job.target_video_profile() {
            if let Some(profile) = encoder_profile(&encoder, &profile) {
                args.extend(["-profile:v:0".to_string(), profile]);
            }
        }
        if let Some(level) = output_codec
            .as_deref()
            .and_then(|codec| encoder_level(&encoder, codec, job.target_video_level()))
        {
            args.extend(["-level".to_string(), level]);
        }

        let start_seconds = job
            .base_request
            .start_time_ticks
            .filter(|ticks| *ticks > 0)
            .map(ticks_to_seconds);
        args.extend(keyframe_args(
            &encoder,
            segment_length,
            job.target_framerate(),
            start_seconds,
        ));

        let chain = build_filter_chain(job, self.options, self.capabilities);
        let video_input = format!("0:{}", self.map_index(stream));
        let subtitle_input = if job.has_external_graphical_subtitle_input() {
            "1:0".to_string()
        } else {
            job.subtitle_stream
                .as_ref()
                .map(|s| format!("0:{}", self.map_index(s)))
                .unwrap_or_else(|| "0:s".to_string())
        };
        args.extend(chain.to_filter_args(&video_input, &subtitle_input));

        args
    }

    /// Encoder and channel arguments for the audio stream.
    pub fn audio_args(&self) -> FfmpegArgs {
        let job = self.job;
        let mut args = FfmpegArgs::new();
        let (Some(stream), Some(codec)) = (job.audio_stream.as_ref(), job.output_audio_codec.as_deref())
        else {
            return args;
        };

        if job.is_audio_copy() {
            args.extend(["-codec:a:0", "copy"]);
            if job.is_video_copy() && job.base_request.break_on_non_key_frames {
                args.extend(["-copypriorss:a:0", "0"]);
            }
            args.extend(audio_bitstream_filter_args(job, stream));
            return args;
        }

        let encoder = job
            .audio_encoder
            .clone()
            .unwrap_or_else(|| audio_encoder_for(codec));
        args.extend(["-codec:a:0", encoder.as_str()]);
        if matches!(encoder.as_str(), "libopus" | "opus" | "dca" | "truehd") {
            args.extend(["-strict", "-2"]);
        }

        if let Some(channels) = job.output_audio_channels {
            args.extend(["-ac".to_string(), channels.to_string()]);
        }
        if let Some(bitrate) = job.output_audio_bitrate {
            if !is_lossless_audio_encoder(&encoder) {
                args.extend(["-ab".to_string(), bitrate.to_string()]);
            }
        }
        if let Some(sample_rate) = job.output_audio_sample_rate {
            args.extend(["-ar".to_string(), sample_rate.to_string()]);
        }

        let downmixing = job
            .output_audio_channels
            .zip(stream.channels)
            .is_some_and(|(output, input)| output <= 2 && input > 2);
        if downmixing {
            args.extend(["-af".to_string(), format!("volume={}", self.options.downmix_audio_boost)]);
        }

        args
    }

    /// Complete HLS transcode writing `output_path` and its numbered segments.
    pub fn hls_command_line(
        &self,
        output_path: &Path,
        segment_length: u32,
        start_number: i64,
    ) -> FfmpegArgs {
        let job = self.job;
        let base_name = output_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let directory = output_path.parent().unwrap_or_else(|| Path::new("."));
        let extension = job.segment_extension();
        let threads = thread_count(
            job.base_request
                .cpu_core_limit
                .unwrap_or(self.options.encoding_thread_count),
        );

        let mut args = self.input_args();
        args.extend(["-threads".to_string(), threads.to_string()]);
        args.append(self.map_args());
        args.extend(["-map_metadata", "-1", "-map_chapters", "-1"]);
        args.append(self.video_args(segment_length));
        args.append(self.audio_args());
        args.extend(["-copyts", "-avoid_negative_ts", "disabled"]);
        args.extend([
            "-max_muxing_queue_size".to_string(),
            self.options.max_muxing_queue_size.to_string(),
        ]);
        args.extend(["-f", "hls", "-max_delay", "5000000"]);
        args.extend(["-hls_time".to_string(), segment_length.to_string()]);
        args.extend([
            "-hls_segment_type",
            if job.is_fmp4() { "fmp4" } else { "mpegts" },
        ]);
        args.extend(["-start_number".to_string(), start_number.to_string()]);
        if job.is_fmp4() {
            args.extend(["-hls_fmp4_init_filename".to_string(), format!("{base_name}-1.mp4")]);
        }
        args.extend([
            "-hls_segment_filename".to_string(),
            directory
                .join(format!("{base_name}%d{extension}"))
                .to_string_lossy()
                .into_owned(),
        ]);
        args.extend(["-hls_playlist_type", "vod", "-hls_list_size", "0", "-y"]);
        args.push(output_path.to_string_lossy().into_owned());
        args
    }
}

/// `-threads` value: 0 stays automatic, anything else is capped at the CPU count.
pub fn thread_count(requested: u32) -> u32 {
    let cpus = u32::try_from(num_cpus::get()).unwrap_or(u32::MAX);
    if requested == 0 { 0 } else { requested.min(cpus) }
}

/// `-preset` value for encoders that take one.
fn encoder_preset(encoder: &str, preset: &str) -> Option<String> {
    let preset = preset.trim().to_ascii_lowercase();
    if preset.is_empty() {
        return None;
    }
    match encoder {
        "libx264" | "libx265" | "h264_qsv" | "hevc_qsv" | "av1_qsv" => Some(preset),
        "libsvtav1" => {
            let level = match preset.as_str() {
                "veryslow" => 2,
                "slower" => 3,
                "slow" => 4,
                "medium" => 5,
                "fast" => 6,
                "faster" => 7,
                "veryfast" => 8,
                "superfast" => 9,
                _ => 10,
            };
            Some(level.to_string())
        }
        e if e.ends_with("_nvenc") => {
            let level = match preset.as_str() {
                "veryslow" => "p7",
                "slower" => "p6",
                "slow" => "p5",
                "medium" => "p4",
                "fast" => "p3",
                "faster" => "p2",
                _ => "p1",
            };
            Some(level.to_string())
        }
        _ => None,
    }
}

/// Rate control arguments; every encoder spells them differently.
pub fn video_bitrate_args(encoder: &str, bitrate: u32) -> Vec<String> {
    let b = bitrate as u64;
    match encoder {
        "libx264" | "libx265" => vec![
            "-maxrate".to_string(),
            b.to_string(),
            "-bufsize".to_string(),
            (b * 2).to_string(),
        ],
        "libvpx" | "libvpx-vp9" => vec![
            "-maxrate:v".to_string(),
            b.to_string(),
            "-bufsize:v".to_string(),
            (b * 2).to_string(),
            "-b:v".to_string(),
            b.to_string(),
        ],
        "libsvtav1" => vec![
            "-b:v".to_string(),
            b.to_string(),
            "-bufsize".to_string(),
            (b * 2).to_string(),
        ],
        e if e.ends_with("_amf") => vec![
            "-rc".to_string(),
            "cbr".to_string(),
            "-qmin".to_string(),
            "0".to_string(),
            "-qmax".to_string(),
            "32".to_string(),
            "-b:v".to_string(),
            b.to_string(),
            "-maxrate".to_string(),
            b.to_string(),
            "-bufsize".to_string(),
            (b * 2).to_string(),
        ],
        e if e.ends_with("_vaapi") => vec![
            "-rc_mode".to_string(),
            "VBR".to_string(),
            "-b:v".to_string(),
            b.to_string(),
            "-maxrate".to_string(),
            b.to_string(),
            "-bufsize".to_string(),
            (b * 2).to_string(),
        ],
        e => {
            // QSV rejects rates below 1 kbps
            let b = if e.ends_with("_qsv") { b.max(1000) } else { b };
            vec![
                "-b:v".to_string(),
                b.to_string(),
                "-maxrate".to_string(),
                b.to_string(),
                "-bufsize".to_string(),
                (b * 2).to_string(),
            ]
        }
    }
}

fn encoder_profile(encoder: &str, profile: &str) -> Option<String> {
    let profile = profile.replace(' ', "").to_ascii_lowercase();
    match encoder {
        "libx264" => Some(match profile.as_str() {
            "constrainedbaseline" => "baseline".to_string(),
            "constrainedhigh" => "high".to_string(),
            _ => profile,
        }),
        "libvpx" | "libvpx-vp9" | "libsvtav1" | "mpeg4" | "libtheora" => None,
        _ => Some(profile),
    }
}

/// `-level` value, clamped to what encoders accept.
fn encoder_level(encoder: &str, codec: &str, level: Option<f64>) -> Option<String> {
    let level = level.filter(|l| *l > 0.0)?;
    match codec {
        "h264" => Some(format!("{}", level.min(51.0).round() as u32)),
        "hevc" => {
            let level = level.min(150.0);
            // libx265 and hardware encoders take the major.minor form
            if encoder == "libx265" || backend_of_encoder(encoder) != HardwareAccelerationType::None {
                Some(format!("{:.1}", level / 30.0))
            } else {
                Some(format!("{}", level.round() as u32))
            }
        }
        _ => None,
    }
}

/// Keyframe placement so segment boundaries land on IDR frames.
fn keyframe_args(
    encoder: &str,
    segment_length: u32,
    framerate: Option<f32>,
    start_seconds: Option<f64>,
) -> Vec<String> {
    let mut args = Vec::new();
    if segment_length == 0 {
        return args;
    }

    let force_key_frames = match start_seconds {
        Some(start) => format!("expr:gte(t,{start}+n_forced*{segment_length})"),
        None => format!("expr:gte(t,n_forced*{segment_length})"),
    };
    let gop = framerate
        .filter(|fps| *fps > 0.0)
        .map(|fps| (segment_length as f64 * fps as f64).ceil() as u64);
    let gop_args = |args: &mut Vec<String>| {
        if let Some(gop) = gop {
            args.extend([
                "-g:v:0".to_string(),
                gop.to_string(),
                "-keyint_min:v:0".to_string(),
                gop.to_string(),
            ]);
        }
    };

    let backend = backend_of_encoder(encoder);
    let gop_only = matches!(
        backend,
        HardwareAccelerationType::Qsv
            | HardwareAccelerationType::Nvenc
            | HardwareAccelerationType::Amf
            | HardwareAccelerationType::Rkmpp
    );
    let force_only = matches!(encoder, "libx264" | "libx265" | "libsvtav1")
        || backend == HardwareAccelerationType::Vaapi;

    if gop_only {
        gop_args(&mut args);
    } else if force_only {
        args.extend(["-force_key_frames:0".to_string(), force_key_frames]);
        if encoder == "libx264" {
            args.extend(["-sc_threshold:v:0".to_string(), "0".to_string()]);
        }
    } else {
        args.extend(["-force_key_frames:0".to_string(), force_key_frames]);
        gop_args(&mut args);
    }
    args
}

fn range_type_requested(requested: &[String], prefix: &str) -> bool {
    requested
        .iter()
        .any(|r| r.to_ascii_lowercase().starts_with(prefix))
}

/// `-bsf:v` for stream copies.
///
/// Strips dynamic HDR metadata the client did not declare and converts
/// length-prefixed NAL units for MPEG-TS output.
fn video_bitstream_filter_args(job: &EncodingJobInfo, stream: &MediaStream) -> Vec<String> {
    let codec = stream.codec.as_deref().map(normalize_codec).unwrap_or_default();
    let requested = job.base_request.requested_range_types(&codec);
    let metadata_filter = match codec.as_str() {
        "hevc" => Some("hevc_metadata"),
        "av1" => Some("av1_metadata"),
        _ => None,
    };

    let mut filters = Vec::new();
    if let Some(metadata) = metadata_filter {
        if stream.video_range_type.is_dolby_vision() && !range_type_requested(&requested, "dovi") {
            filters.push(format!("{metadata}=remove_dovi=1"));
        }
        if stream.video_range_type == VideoRangeType::Hdr10Plus
            && !range_type_requested(&requested, "hdr10plus")
        {
            filters.push(format!("{metadata}=remove_hdr10plus=1"));
        }
    }

    let mp4_input = job
        .input_container
        .as_deref()
        .is_some_and(|c| c.split(',').any(|c| matches!(c, "mp4" | "m4v" | "mov")));
    if !job.is_fmp4() && mp4_input {
        match codec.as_str() {
            "h264" => filters.push("h264_mp4toannexb".to_string()),
            "hevc" => filters.push("hevc_mp4toannexb".to_string()),
            _ => {}
        }
    }

    if filters.is_empty() {
        Vec::new()
    } else {
        vec!["-bsf:v".to_string(), filters.join(",")]
    }
}

fn audio_bitstream_filter_args(job: &EncodingJobInfo, stream: &MediaStream) -> Vec<String> {
    let ts_input = job
        .input_container
        .as_deref()
        .is_some_and(|c| matches!(c, "ts" | "mpegts" | "m2ts"));
    if stream.is_aac() && ts_input && job.is_fmp4() {
        vec!["-bsf:a".to_string(), "aac_adtstoasc".to_string()]
    } else {
        Vec::new()
    }
}

fn is_lossless_audio_encoder(encoder: &str) -> bool {
    matches!(encoder, "flac" | "alac" | "truehd") || encoder.starts_with("pcm_")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::encoding::options::BaseEncodingJobOptions;
    use crate::media::{MediaSourceInfo, MediaStreamType};

    fn source() -> MediaSourceInfo {
        MediaSourceInfo {
            path: "/media/movie.mkv".to_string(),
            container: Some("mkv".to_string()),
            media_streams: vec![
                MediaStream {
                    index: 0,
                    stream_type: MediaStreamType::Video,
                    codec: Some("h264".to_string()),
                    width: Some(1920),
                    height: Some(1080),
                    real_frame_rate: Some(24.0),
                    ..Default::default()
                },
                MediaStream {
                    index: 1,
                    stream_type: MediaStreamType::Audio,
                    codec: Some("ac3".to_string()),
                    channels: Some(6),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    fn transcode_job() -> EncodingJobInfo {
        let source = source();
        let mut job = EncodingJobInfo::new(
            BaseEncodingJobOptions {
                start_time_ticks: Some(900_000_000),
                ..Default::default()
            },
            TranscodingJobType::Hls,
        );
        job.media_path = source.path.clone();
        job.video_stream = Some(source.media_streams[0].clone());
        job.audio_stream = Some(source.media_streams[1].clone());
        job.media_source = Some(source);
        job.output_video_codec = Some("h264".to_string());
        job.video_encoder = Some("libx264".to_string());
        job.output_video_bitrate = Some(4_000_000);
        job.output_audio_codec = Some("aac".to_string());
        job.audio_encoder = Some("aac".to_string());
        job.output_audio_channels = Some(2);
        job.output_audio_bitrate = Some(256_000);
        job
    }

    fn builder<'a>(
        job: &'a EncodingJobInfo,
        options: &'a EncodingOptions,
        caps: &'a HardwareCapabilities,
    ) -> CommandLineBuilder<'a> {
        CommandLineBuilder::new(job, options, caps, Platform::Linux)
    }

    #[test]
    fn test_thread_count_capped_at_cpus() {
        assert_eq!(thread_count(0), 0);
        assert_eq!(thread_count(1), 1);
        assert_eq!(thread_count(u32::MAX) as usize, num_cpus::get());
    }

    #[test]
    fn test_input_args_seek_and_input() {
        let job = transcode_job();
        let options = EncodingOptions::default();
        let caps = HardwareCapabilities::default();
        let args = builder(&job, &options, &caps).input_args();
        assert_eq!(args.value_of("-ss"), Some("00:01:30.000"));
        assert_eq!(args.value_of("-i"), Some("/media/movie.mkv"));
        assert!(!args.contains("-noaccurate_seek"));
    }

    #[test]
    fn test_map_args() {
        let job = transcode_job();
        let options = EncodingOptions::default();
        let caps = HardwareCapabilities::default();
        let args = builder(&job, &options, &caps).map_args();
        assert_eq!(
            args.as_slice(),
            &["-map", "0:0", "-map", "0:1", "-map", "-0:s"].map(String::from)
        );
    }

    #[test]
    fn test_video_args_for_libx264() {
        let job = transcode_job();
        let options = EncodingOptions::default();
        let caps = HardwareCapabilities::default();
        let args = builder(&job, &options, &caps).video_args(6);
        assert_eq!(args.value_of("-codec:v:0"), Some("libx264"));
        assert_eq!(args.value_of("-preset"), Some("veryfast"));
        assert_eq!(args.value_of("-crf"), Some("23"));
        assert_eq!(args.value_of("-maxrate"), Some("4000000"));
        assert_eq!(args.value_of("-bufsize"), Some("8000000"));
        assert_eq!(
            args.value_of("-force_key_frames:0"),
            Some("expr:gte(t,90+n_forced*6)")
        );
        assert_eq!(args.value_of("-sc_threshold:v:0"), Some("0"));
        assert!(!args.contains("-g:v:0"));
    }

    #[test]
    fn test_keyframe_args_for_hardware_encoders() {
        assert_eq!(
            keyframe_args("h264_nvenc", 6, Some(23.976), None),
            ["-g:v:0", "144", "-keyint_min:v:0", "144"].map(String::from).to_vec()
        );
        let other = keyframe_args("libvpx-vp9", 3, Some(30.0), None);
        assert_eq!(other[0], "-force_key_frames:0");
        assert!(other.contains(&"90".to_string()));
    }

    #[test]
    fn test_video_copy_strips_unrequested_dovi() {
        let mut job = transcode_job();
        job.output_video_codec = Some("copy".to_string());
        if let Some(stream) = job.video_stream.as_mut() {
            stream.codec = Some("hevc".to_string());
            stream.video_range_type = VideoRangeType::DoViWithHdr10;
        }
        job.segment_container = "mp4".to_string();
        let options = EncodingOptions::default();
        let caps = HardwareCapabilities::default();
        let args = builder(&job, &options, &caps).video_args(6);
        assert_eq!(args.value_of("-codec:v:0"), Some("copy"));
        assert_eq!(args.value_of("-tag:v:0"), Some("hvc1"));
        assert_eq!(args.value_of("-bsf:v"), Some("hevc_metadata=remove_dovi=1"));
        assert!(args.contains("-start_at_zero"));
    }

    #[test]
    fn test_video_copy_annexb_for_ts_from_mp4() {
        let mut job = transcode_job();
        job.output_video_codec = Some("copy".to_string());
        job.input_container = Some("mov,mp4,m4a".to_string());
        let options = EncodingOptions::default();
        let caps = HardwareCapabilities::default();
        let args = builder(&job, &options, &caps).video_args(6);
        assert_eq!(args.value_of("-bsf:v"), Some("h264_mp4toannexb"));
    }

    #[test]
    fn test_audio_args_downmix() {
        let job = transcode_job();
        let options = EncodingOptions::default();
        let caps = HardwareCapabilities::default();
        let args = builder(&job, &options, &caps).audio_args();
        assert_eq!(
            args.as_slice(),
            &["-codec:a:0", "aac", "-ac", "2", "-ab", "256000", "-af", "volume=2"].map(String::from)
        );
    }

    #[test]
    fn test_bitrate_args_per_encoder() {
        assert_eq!(video_bitrate_args("h264_qsv", 500)[1], "1000");
        assert_eq!(video_bitrate_args("h264_vaapi", 2_000_000)[..2], ["-rc_mode", "VBR"]);
        assert_eq!(video_bitrate_args("libsvtav1", 1_000)[0], "-b:v");
    }

    #[test]
    fn test_encoder_profile_and_level() {
        assert_eq!(encoder_profile("libx264", "Constrained Baseline").as_deref(), Some("baseline"));
        assert_eq!(encoder_profile("libsvtav1", "main"), None);
        assert_eq!(encoder_level("libx264", "h264", Some(52.0)).as_deref(), Some("51"));
        assert_eq!(encoder_level("libx265", "hevc", Some(153.0)).as_deref(), Some("5.0"));
        assert_eq!(encoder_level("libx264", "h264", None), None);
    }

    #[test]
    fn test_hls_command_line_layout() {
        let mut job = transcode_job();
        job.segment_container = "mp4".to_string();
        let options = EncodingOptions::default();
        let caps = HardwareCapabilities::default();
        let output = PathBuf::from("/transcodes/abc.m3u8");
        let args = builder(&job, &options, &caps).hls_command_line(&output, 6, 3);

        assert_eq!(args.value_of("-f"), Some("hls"));
        assert_eq!(args.value_of("-hls_time"), Some("6"));
        assert_eq!(args.value_of("-hls_segment_type"), Some("fmp4"));
        assert_eq!(args.value_of("-start_number"), Some("3"));
        assert_eq!(args.value_of("-hls_fmp4_init_filename"), Some("abc-1.mp4"));
        assert_eq!(args.value_of("-hls_segment_filename"), Some("/transcodes/abc%d.mp4"));
        assert_eq!(args.value_of("-avoid_negative_ts"), Some("disabled"));
        assert_eq!(args.as_slice().last().map(String::as_str), Some("/transcodes/abc.m3u8"));
        assert!(args.contains("-copyts"));
    }

    #[test]
    fn test_display_quotes_arguments_with_spaces() {
        let args = FfmpegArgs::from(vec!["-i".to_string(), "/media/my movie.mkv".to_string()]);
        assert_eq!(args.to_string(), "-i \"/media/my movie.mkv\"");
    }
}
