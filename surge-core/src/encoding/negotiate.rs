//! Request negotiation: stream selection, codec ordering, stream copy and
//! output parameter derivation.

use tracing::debug;

use crate::config::{EncodingOptions, HlsConfig};
use crate::encoding::bitrate::{
    audio_bitrate_param, audio_channels_param, audio_encoder_for, scale_bitrate,
    video_bitrate_param_value,
};
use crate::encoding::hwaccel::{
    HardwareAccelerationType, HardwareCapabilities, Platform, can_hardware_decode, select_backend,
    video_encoder_for,
};
use crate::encoding::job_info::{EncodingJobInfo, TranscodingJobType};
use crate::encoding::options::{BaseEncodingJobOptions, SubtitleDeliveryMethod};
use crate::encoding::resolution::normalize_resolution;
use crate::encoding::{EncodingError, is_copy_codec, normalize_codec};
use crate::media::{MediaSourceInfo, MediaStream, MediaStreamType, VideoRangeType};

/// Server-side inputs to negotiation.
#[derive(Debug, Clone, Copy)]
pub struct NegotiationContext<'a> {
    pub options: &'a EncodingOptions,
    pub hls: &'a HlsConfig,
    pub capabilities: &'a HardwareCapabilities,
    pub platform: Platform,
}

/// Negotiates a complete plan for `request` against `source`.
///
/// Runs stream selection, codec shifting, stream-copy checks, bitrate and
/// channel derivation and hardware backend selection, in that order.
pub fn negotiate(
    ctx: &NegotiationContext<'_>,
    request: BaseEncodingJobOptions,
    transcoding_type: TranscodingJobType,
    source: MediaSourceInfo,
    requested_url: &str,
) -> Result<EncodingJobInfo, EncodingError> {
    let mut job = EncodingJobInfo::new(request, transcoding_type);
    attach_media_source_info(&mut job, ctx, source, requested_url)?;

    if job.video_stream.is_none() && job.audio_stream.is_none() {
        return Err(EncodingError::NoMediaStreams {
            reason: format!("{} has no audio or video streams", job.media_path),
        });
    }

    job.output_container = job
        .base_request
        .container
        .as_deref()
        .map(|c| c.trim_start_matches('.').to_string());
    job.segment_container = job
        .base_request
        .segment_container
        .clone()
        .unwrap_or_else(|| ctx.hls.default_segment_container.clone())
        .trim_start_matches('.')
        .to_ascii_lowercase();

    job.output_audio_codec = job.base_request.audio_codec.clone();
    job.output_audio_sample_rate = job.base_request.audio_sample_rate;
    job.output_video_codec = if job.is_video_request {
        job.base_request.video_codec.clone()
    } else {
        None
    };
    job.output_video_bitrate = video_bitrate_param_value(
        &job.base_request,
        job.video_stream.as_ref(),
        job.output_video_codec.as_deref(),
    );

    try_stream_copy(&mut job);

    let is_progressive = job.transcoding_type == TranscodingJobType::Progressive;
    job.output_audio_channels = audio_channels_param(
        &job.base_request,
        job.audio_stream.as_ref(),
        job.output_audio_codec.as_deref(),
        is_progressive,
    );
    job.output_audio_bitrate = audio_bitrate_param(
        job.base_request.audio_bit_rate,
        job.output_audio_codec.as_deref(),
        job.audio_stream.as_ref(),
        job.output_audio_channels,
    );

    if job.video_stream.is_some() && !job.is_video_copy() {
        if let Some(bitrate) = job.output_video_bitrate {
            apply_resolution_ceiling(&mut job, bitrate);
        }
    }

    select_encoders(&mut job, ctx)?;

    debug!(
        "Negotiated {}: video={:?} ({:?}) audio={:?} ({:?}) backend={} hw_decode={}",
        job.media_path,
        job.output_video_codec,
        job.video_encoder,
        job.output_audio_codec,
        job.audio_encoder,
        job.hw_backend,
        job.hardware_decoding
    );
    Ok(job)
}

/// Populates `job` from a source description.
///
/// Selects streams, applies input sync flags for problematic containers,
/// turns fixed resolutions into ceilings and reorders the candidate codec
/// lists so risky codecs are only chosen as a last resort.
pub fn attach_media_source_info(
    job: &mut EncodingJobInfo,
    ctx: &NegotiationContext<'_>,
    source: MediaSourceInfo,
    requested_url: &str,
) -> Result<(), EncodingError> {
    if source.path.is_empty() {
        return Err(EncodingError::MissingMediaSource);
    }

    job.media_path = source.path.clone();
    job.input_protocol = source.protocol;
    job.input_container = source.container.clone();
    job.run_time_ticks = source.run_time_ticks;
    job.read_input_at_native_framerate = source.read_at_native_framerate;
    job.media_source = Some(source.clone());

    if (job.read_input_at_native_framerate && !job.is_segmented_live_stream())
        || source.container_is("wtv")
    {
        job.input_video_sync = Some("-1".to_string());
        job.input_audio_sync = Some("1".to_string());
    }
    if source.container_is("wma") || source.container_is("asf") {
        job.input_audio_sync = Some("1".to_string());
    }

    let streams = &source.media_streams;
    let audio_index = job
        .base_request
        .audio_stream_index
        .or(source.default_audio_stream_index);

    if job.is_video_request {
        if job.base_request.video_codec.is_none() {
            job.base_request.video_codec = Some(infer_video_codec(requested_url).to_string());
        }

        job.video_stream = get_media_stream(
            streams,
            job.base_request.video_stream_index,
            MediaStreamType::Video,
            true,
        );
        job.subtitle_stream = get_media_stream(
            streams,
            job.base_request.subtitle_stream_index,
            MediaStreamType::Subtitle,
            false,
        );
        job.subtitle_delivery_method = job.base_request.subtitle_method;
        job.audio_stream = get_media_stream(streams, audio_index, MediaStreamType::Audio, true);

        enforce_resolution_limit(&mut job.base_request);
        normalize_subtitle_embed(job);
    } else {
        job.audio_stream = get_media_stream(streams, audio_index, MediaStreamType::Audio, true);
    }

    let mut audio_codecs = job.base_request.audio_codecs();
    if !audio_codecs.is_empty() {
        shift_audio_codecs_if_needed(&mut audio_codecs, job.audio_stream.as_ref());
        let preferred = audio_codecs
            .iter()
            .find(|codec| {
                ctx.capabilities.encoders.is_empty()
                    || is_copy_codec(Some(codec.as_str()))
                    || ctx.capabilities.has_encoder(&audio_encoder_for(codec.as_str()))
            })
            .or_else(|| audio_codecs.first())
            .cloned();
        job.base_request.audio_codec = preferred;
        job.supported_audio_codecs = audio_codecs;
    }

    let mut video_codecs = job.base_request.video_codecs();
    if !video_codecs.is_empty() {
        shift_video_codecs_if_needed(&mut video_codecs, ctx.options);
        job.base_request.video_codec = video_codecs.first().cloned();
        job.supported_video_codecs = video_codecs;
    }

    Ok(())
}

/// Picks a stream of `stream_type`, preferring `desired_index`.
///
/// Without a match, audio falls back to the first stream that has channels,
/// and everything else to the first stream, unless `return_first` is off.
pub fn get_media_stream(
    streams: &[MediaStream],
    desired_index: Option<i32>,
    stream_type: MediaStreamType,
    return_first: bool,
) -> Option<MediaStream> {
    let mut candidates: Vec<&MediaStream> = streams
        .iter()
        .filter(|stream| stream.stream_type == stream_type)
        .collect();
    candidates.sort_by_key(|stream| stream.index);

    if let Some(index) = desired_index {
        if let Some(stream) = candidates.iter().find(|stream| stream.index == index) {
            return Some((*stream).clone());
        }
    }

    if !return_first {
        return None;
    }

    if stream_type == MediaStreamType::Audio {
        if let Some(stream) = candidates
            .iter()
            .find(|stream| stream.channels.is_some_and(|c| c > 0))
        {
            return Some((*stream).clone());
        }
    }
    candidates.first().map(|stream| (*stream).clone())
}

/// Guesses an output video codec from the requested URL's extension.
pub fn infer_video_codec(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let extension = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "asf" => "wmv",
        "webm" => "vp8",
        "ogg" | "ogv" => "theora",
        "m3u8" | "ts" => "h264",
        _ => "copy",
    }
}

/// Turns fixed width/height requests into ceilings.
fn enforce_resolution_limit(request: &mut BaseEncodingJobOptions) {
    request.max_width = request.max_width.or(request.width);
    request.max_height = request.max_height.or(request.height);
    request.width = None;
    request.height = None;
}

/// DVB subtitles cannot be remuxed reliably, so they are burned in instead.
fn normalize_subtitle_embed(job: &mut EncodingJobInfo) {
    if job.subtitle_delivery_method != SubtitleDeliveryMethod::Embed {
        return;
    }
    if job
        .subtitle_stream
        .as_ref()
        .is_some_and(|stream| stream.codec_is("dvbsub") || stream.codec_is("dvb_subtitle"))
    {
        job.subtitle_delivery_method = SubtitleDeliveryMethod::Encode;
    }
}

/// Moves every leading codec found in `shift` to the back of `codecs`.
///
/// A list made only of shifted codecs is left alone.
fn rotate_shifted_codecs(codecs: &mut [String], shift: &[&str]) {
    let is_shifted = |codec: &str| shift.iter().any(|s| s.eq_ignore_ascii_case(codec));
    if codecs.iter().all(|codec| is_shifted(codec.as_str())) {
        return;
    }
    while codecs.first().is_some_and(|codec| is_shifted(codec.as_str())) {
        codecs.rotate_left(1);
    }
}

/// DTS/TrueHD are not HLS-safe for surround sources, and AC3/EAC3 break when
/// transcoded to stereo, so those drift to the end of the preference list.
pub fn shift_audio_codecs_if_needed(codecs: &mut [String], audio_stream: Option<&MediaStream>) {
    if codecs.len() < 2 {
        return;
    }
    let input_channels = audio_stream.and_then(|s| s.channels).unwrap_or(6);
    let shift: &[&str] = if input_channels >= 6 {
        &["dts", "truehd"]
    } else {
        &["ac3", "eac3"]
    };
    rotate_shifted_codecs(codecs, shift);
}

/// Disallowed encoders drift to the end of the preference list.
pub fn shift_video_codecs_if_needed(codecs: &mut [String], options: &EncodingOptions) {
    if codecs.len() < 2 {
        return;
    }
    let mut shift: Vec<&str> = Vec::new();
    if !options.allow_hevc_encoding {
        shift.extend(["hevc", "h265"]);
    }
    if !options.allow_av1_encoding {
        shift.push("av1");
    }
    if shift.is_empty() {
        return;
    }
    rotate_shifted_codecs(codecs, &shift);
}

/// Profile rank within a codec; lower ranks are more widely decodable.
fn video_profile_score(codec: &str, profile: &str) -> Option<usize> {
    let profile = profile.replace(' ', "");
    let order: &[&str] = match normalize_codec(codec).as_str() {
        "h264" => &[
            "ConstrainedBaseline",
            "Baseline",
            "Extended",
            "Main",
            "ConstrainedHigh",
            "High",
            "ProgressiveHigh",
        ],
        "hevc" => &["Main", "Main10"],
        "av1" => &["Main", "High", "Professional"],
        _ => &[],
    };
    order
        .iter()
        .position(|candidate| candidate.eq_ignore_ascii_case(&profile))
}

fn range_type_allowed(source: VideoRangeType, requested: &[String]) -> bool {
    let has = |range: VideoRangeType| {
        requested
            .iter()
            .any(|r| r.eq_ignore_ascii_case(range.as_str()))
    };
    if has(source) {
        return true;
    }
    match source {
        VideoRangeType::DoViWithHdr10 | VideoRangeType::Hdr10Plus => has(VideoRangeType::Hdr10),
        VideoRangeType::DoViWithHlg => has(VideoRangeType::Hlg),
        VideoRangeType::DoViWithSdr => has(VideoRangeType::Sdr),
        _ => false,
    }
}

/// Whether `stream` can be passed through untouched for this request.
pub fn can_stream_copy_video(job: &EncodingJobInfo, stream: &MediaStream) -> bool {
    let request = &job.base_request;
    let codec = stream.codec.as_deref().unwrap_or_default();

    if !request.allow_video_stream_copy {
        return false;
    }
    if stream.is_interlaced && job.deinterlace(codec, false) {
        return false;
    }
    if stream.is_anamorphic.unwrap_or(false) && request.require_non_anamorphic {
        return false;
    }
    // Burn-in needs decoded frames
    if request.subtitle_stream_index.is_some_and(|i| i >= 0)
        && job.subtitle_delivery_method == SubtitleDeliveryMethod::Encode
    {
        return false;
    }
    if stream.is_h264() && stream.is_avc == Some(false) && request.require_avc {
        return false;
    }

    if codec.is_empty()
        || (!job.supported_video_codecs.is_empty()
            && !job
                .supported_video_codecs
                .iter()
                .any(|c| normalize_codec(c) == normalize_codec(codec)))
    {
        return false;
    }

    let requested_profiles = request.requested_profiles(codec);
    if let (Some(requested), Some(profile)) = (requested_profiles.first(), stream.profile.as_deref())
    {
        let profile_compact = profile.replace(' ', "");
        if !requested_profiles
            .iter()
            .any(|p| p.eq_ignore_ascii_case(&profile_compact))
        {
            match (
                video_profile_score(codec, profile),
                video_profile_score(codec, requested),
            ) {
                (Some(current), Some(wanted)) if current <= wanted => {}
                _ => return false,
            }
        }
    }

    let requested_ranges = request.requested_range_types(codec);
    if !requested_ranges.is_empty() {
        if stream.video_range_type == VideoRangeType::Unknown {
            return false;
        }
        if !range_type_allowed(stream.video_range_type, &requested_ranges) {
            return false;
        }
    }

    if let Some(max_width) = request.max_width {
        if stream.width.is_none_or(|w| w > max_width) {
            return false;
        }
    }
    if let Some(max_height) = request.max_height {
        if stream.height.is_none_or(|h| h > max_height) {
            return false;
        }
    }

    if let Some(requested) = request.max_framerate.or(request.framerate) {
        // Sources often report a hair above their nominal rate
        if stream
            .reference_frame_rate()
            .is_none_or(|rate| rate > requested + 0.05)
        {
            return false;
        }
    }

    if let Some(requested) = request.video_bit_rate {
        if stream.bit_rate.is_none_or(|b| b > requested) {
            // Live sources often have no bitrate; let them copy if all else fits
            let unknown_live_bitrate = request.live_stream_id.is_some() && stream.bit_rate.is_none();
            if !unknown_live_bitrate {
                return false;
            }
        }
    }

    if let (Some(max), Some(depth)) = (request.requested_video_bit_depth(codec), stream.bit_depth) {
        if depth > max {
            return false;
        }
    }
    if let (Some(max), Some(refs)) = (request.requested_max_ref_frames(codec), stream.ref_frames) {
        if refs > max {
            return false;
        }
    }
    if let (Some(max), Some(level)) = (request.requested_level(codec), stream.level) {
        if level > max {
            return false;
        }
    }

    if job.input_container.as_deref().is_some_and(|c| c.eq_ignore_ascii_case("avi"))
        && stream.is_h264()
        && !stream.is_avc.unwrap_or(false)
    {
        return false;
    }

    request.enable_auto_stream_copy
}

/// Whether `stream` can be passed through for one of `supported_codecs`.
pub fn can_stream_copy_audio(
    job: &EncodingJobInfo,
    stream: &MediaStream,
    supported_codecs: &[String],
) -> bool {
    let request = &job.base_request;
    let codec = stream.codec.as_deref().unwrap_or_default();

    if !request.allow_audio_stream_copy {
        return false;
    }
    if let (Some(max), Some(depth)) = (request.requested_audio_bit_depth(codec), stream.bit_depth) {
        if depth > max {
            return false;
        }
    }
    if codec.is_empty()
        || !supported_codecs
            .iter()
            .any(|c| normalize_codec(c) == normalize_codec(codec))
    {
        return false;
    }
    if let Some(max_channels) = request.requested_audio_channels(codec) {
        match stream.channels {
            Some(channels) if channels > 0 && channels <= max_channels => {}
            _ => return false,
        }
    }
    if let Some(max_rate) = request.audio_sample_rate {
        match stream.sample_rate {
            Some(rate) if rate > 0 && rate <= max_rate => {}
            _ => return false,
        }
    }
    if let (Some(max), Some(bitrate)) = (request.audio_bit_rate, stream.bit_rate) {
        if bitrate > max {
            return false;
        }
    }

    request.enable_auto_stream_copy
}

/// Switches video and audio to `copy` wherever passthrough satisfies the request.
pub fn try_stream_copy(job: &mut EncodingJobInfo) {
    if let Some(stream) = job.video_stream.clone() {
        if job.is_video_request && can_stream_copy_video(job, &stream) {
            job.output_video_codec = Some("copy".to_string());
        }
    }

    if let Some(stream) = job.audio_stream.clone() {
        let supported = job.supported_audio_codecs.clone();
        if can_stream_copy_audio(job, &stream, &supported) {
            job.output_audio_codec = Some("copy".to_string());
        }
    }
}

/// Lowers the resolution ceiling to what the output bitrate can carry.
fn apply_resolution_ceiling(job: &mut EncodingJobInfo, output_bitrate: u32) {
    let request = &job.base_request;
    let Some(stream) = job.video_stream.as_ref() else {
        return;
    };

    let resolution_not_requested = request.width.is_none()
        && request.height.is_none()
        && request.max_width.is_none()
        && request.max_height.is_none();

    if resolution_not_requested
        && matches!(
            (request.video_bit_rate, stream.bit_rate),
            (Some(requested), Some(source)) if requested >= source
        )
    {
        // Enough bits for the source resolution; keep it
        if stream.width.is_some() || stream.height.is_some() {
            job.base_request.max_width = stream.width;
            job.base_request.max_height = stream.height;
        }
        return;
    }

    let h264_equivalent = scale_bitrate(
        output_bitrate,
        job.output_video_codec.as_deref(),
        Some("h264"),
    );
    let (max_width, max_height) = normalize_resolution(
        stream.bit_rate,
        output_bitrate,
        h264_equivalent,
        request.max_width,
        request.max_height,
        job.target_framerate(),
    );
    job.base_request.max_width = max_width;
    job.base_request.max_height = max_height;
}

/// Chooses the hardware backend and concrete encoders.
fn select_encoders(
    job: &mut EncodingJobInfo,
    ctx: &NegotiationContext<'_>,
) -> Result<(), EncodingError> {
    if let Some(codec) = job.output_audio_codec.clone() {
        if !is_copy_codec(Some(&codec)) {
            job.audio_encoder = Some(audio_encoder_for(&codec));
        }
    }

    let Some(stream) = job.video_stream.clone() else {
        return Ok(());
    };
    let Some(codec) = job.output_video_codec.clone() else {
        return Ok(());
    };
    if is_copy_codec(Some(&codec)) {
        return Ok(());
    }

    let backend = select_backend(
        ctx.platform,
        ctx.options.hardware_acceleration,
        ctx.capabilities,
    );
    let encoder = video_encoder_for(&codec, backend, ctx.options, ctx.capabilities);
    if !ctx.capabilities.encoders.is_empty() && !ctx.capabilities.has_encoder(&encoder) {
        return Err(EncodingError::UnsupportedCodec { codec });
    }

    job.hw_backend = backend;
    job.hardware_decoding = backend != HardwareAccelerationType::None
        && can_hardware_decode(backend, &stream, ctx.options);
    job.video_encoder = Some(encoder);
    Ok(())
}
