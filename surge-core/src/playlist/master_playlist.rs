//! Master playlist generation.

use std::fmt::Write as _;

use crate::encoding::codec_strings::playlist_codecs;
use crate::encoding::job_info::EncodingJobInfo;
use crate::encoding::normalize_codec;
use crate::encoding::options::SubtitleDeliveryMethod;
use crate::media::{MediaStreamType, VideoRange, VideoRangeType};

const SUBTITLE_GROUP: &str = "subs";

/// Server-side inputs to the master playlist.
#[derive(Debug, Clone)]
pub struct MasterPlaylistOptions<'a> {
    /// Media playlist path every variant URL starts with, e.g. `main.m3u8`
    pub media_playlist: &'a str,
    pub enable_adaptive_bitrate_streaming: bool,
    /// Advertise an SDR HEVC transcode next to an HDR HEVC copy
    pub enable_sdr_variant: bool,
    /// Prefix for subtitle rendition playlist URIs
    pub subtitle_uri_prefix: &'a str,
}

/// Bitrate step between adaptive variants.
pub fn bitrate_variation(bitrate: u32) -> u32 {
    match bitrate {
        b if b >= 10_000_000 => 2_000_000,
        b if b >= 5_000_000 => 1_500_000,
        b if b >= 3_000_000 => 1_000_000,
        b if b >= 2_000_000 => 500_000,
        b if b >= 1_000_000 => 300_000,
        b if b >= 600_000 => 200_000,
        b if b >= 400_000 => 100_000,
        _ => 50_000,
    }
}

fn video_bitrate(job: &EncodingJobInfo) -> u32 {
    job.output_video_bitrate
        .or_else(|| job.video_stream.as_ref().and_then(|s| s.bit_rate))
        .unwrap_or(0)
}

fn audio_bitrate(job: &EncodingJobInfo) -> u32 {
    job.output_audio_bitrate
        .or_else(|| job.audio_stream.as_ref().and_then(|s| s.bit_rate))
        .unwrap_or(0)
}

/// Combined output bitrate advertised as `BANDWIDTH`.
pub fn total_bitrate(job: &EncodingJobInfo) -> u32 {
    let total = video_bitrate(job).saturating_add(audio_bitrate(job));
    if total > 0 {
        total
    } else {
        job.media_source
            .as_ref()
            .and_then(|source| source.bitrate)
            .unwrap_or(0)
    }
}

/// `VIDEO-RANGE` value, or `None` when the range is not known.
pub fn video_range_attribute(job: &EncodingJobInfo) -> Option<&'static str> {
    let stream = job.video_stream.as_ref()?;
    if !job.is_video_copy() {
        return Some("SDR");
    }
    match stream.video_range_type {
        VideoRangeType::Unknown => None,
        VideoRangeType::Hlg | VideoRangeType::DoViWithHlg => Some("HLG"),
        range if range.video_range() == VideoRange::Hdr => Some("PQ"),
        _ => Some("SDR"),
    }
}

fn variant_url(options: &MasterPlaylistOptions<'_>, job: &EncodingJobInfo) -> String {
    format!("{}{}", options.media_playlist, job.url_query())
}

fn push_variant(
    playlist: &mut String,
    job: &EncodingJobInfo,
    bandwidth: u32,
    has_subtitles: bool,
    url: &str,
) {
    let _ = write!(
        playlist,
        "#EXT-X-STREAM-INF:BANDWIDTH={bandwidth},AVERAGE-BANDWIDTH={bandwidth}"
    );
    if let Some(range) = video_range_attribute(job) {
        let _ = write!(playlist, ",VIDEO-RANGE={range}");
    }
    if let Some(codecs) = playlist_codecs(job) {
        let _ = write!(playlist, ",CODECS=\"{codecs}\"");
    }
    if let (Some(width), Some(height)) = (job.output_width(), job.output_height()) {
        let _ = write!(playlist, ",RESOLUTION={width}x{height}");
    }
    if let Some(framerate) = job.target_framerate().filter(|fps| *fps > 0.0) {
        let _ = write!(playlist, ",FRAME-RATE={framerate:.3}");
    }
    if has_subtitles {
        let _ = write!(playlist, ",SUBTITLES=\"{SUBTITLE_GROUP}\"");
    }
    playlist.push('\n');
    playlist.push_str(url);
    playlist.push('\n');
}

/// `#EXT-X-MEDIA` lines for side-loaded text subtitles. Returns whether any were written.
fn push_subtitle_group(
    playlist: &mut String,
    job: &EncodingJobInfo,
    options: &MasterPlaylistOptions<'_>,
) -> bool {
    if job.subtitle_delivery_method != SubtitleDeliveryMethod::Hls {
        return false;
    }
    let Some(source) = job.media_source.as_ref() else {
        return false;
    };

    let selected = job.subtitle_stream.as_ref().map(|s| s.index);
    let mut written = false;
    for stream in source
        .streams_of(MediaStreamType::Subtitle)
        .into_iter()
        .filter(|s| s.is_text_subtitle_stream())
    {
        let is_default = Some(stream.index) == selected;
        let yes_no = |flag: bool| if flag { "YES" } else { "NO" };
        let _ = write!(
            playlist,
            "#EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"{SUBTITLE_GROUP}\",NAME=\"{}\",DEFAULT={},FORCED={},AUTOSELECT=YES,URI=\"{}{}/subtitles.m3u8{}\"",
            stream.display_title().replace('"', "'"),
            yes_no(is_default),
            yes_no(stream.is_forced),
            options.subtitle_uri_prefix,
            stream.index,
            job.url_query(),
        );
        if let Some(language) = stream.language.as_deref().filter(|l| !l.is_empty()) {
            let _ = write!(playlist, ",LANGUAGE=\"{language}\"");
        }
        playlist.push('\n');
        written = true;
    }
    written
}

fn is_hevc_copy(job: &EncodingJobInfo) -> bool {
    job.is_video_copy()
        && job
            .actual_output_video_codec()
            .is_some_and(|codec| normalize_codec(&codec) == "hevc")
}

/// The same request forced through an SDR HEVC Main transcode.
fn sdr_hevc_variant(job: &EncodingJobInfo) -> EncodingJobInfo {
    let mut variant = job.clone();
    variant.output_video_codec = Some("hevc".to_string());
    for request in [&mut variant.base_request, &mut variant.client_request] {
        request.allow_video_stream_copy = false;
        request
            .stream_options
            .insert("hevc-profile".to_string(), "main".to_string());
    }
    variant
}

/// Renders the master playlist for a negotiated job.
///
/// Emits the primary variant, compatibility variants for HEVC copies and,
/// for re-encodes, up to two lower-bitrate adaptive variants.
pub fn create_master_playlist(job: &EncodingJobInfo, options: &MasterPlaylistOptions<'_>) -> String {
    let mut playlist = String::from("#EXTM3U\n");
    let has_subtitles = push_subtitle_group(&mut playlist, job, options);
    let total = total_bitrate(job);
    let url = variant_url(options, job);

    let hdr_source = job
        .video_stream
        .as_ref()
        .is_some_and(|s| s.video_range() == VideoRange::Hdr);
    if is_hevc_copy(job) && hdr_source && options.enable_sdr_variant {
        let sdr = sdr_hevc_variant(job);
        push_variant(&mut playlist, &sdr, total, has_subtitles, &variant_url(options, &sdr));
    }

    push_variant(&mut playlist, job, total, has_subtitles, &url);

    // Older Apple decoders refuse anything above level 5.0 in the manifest
    let source_level = job.video_stream.as_ref().and_then(|s| s.level).unwrap_or(0.0);
    if is_hevc_copy(job) && source_level > 150.0 {
        let mut compat = job.clone();
        if let Some(stream) = compat.video_stream.as_mut() {
            stream.level = Some(150.0);
        }
        push_variant(&mut playlist, &compat, total, has_subtitles, &url);
    }

    let adaptive = options.enable_adaptive_bitrate_streaming
        && job.base_request.enable_adaptive_bitrate_streaming
        && !job.base_request.is_static
        && job.video_stream.is_some()
        && !job.is_video_copy();
    if adaptive {
        let requested_video = video_bitrate(job);
        let variation = bitrate_variation(total);
        for step in 1..=2u32 {
            let reduction = variation * step;
            if requested_video <= reduction {
                break;
            }
            let mut lower = job.clone();
            lower.base_request.video_bit_rate = Some(requested_video - reduction);
            lower.client_request.video_bit_rate = Some(requested_video - reduction);
            lower.output_video_bitrate = Some(requested_video - reduction);
            push_variant(
                &mut playlist,
                &lower,
                total - reduction,
                has_subtitles,
                &variant_url(options, &lower),
            );
        }
    }

    playlist
}
