//! Bitrate and channel-count decisions.

use crate::encoding::options::BaseEncodingJobOptions;
use crate::encoding::{is_copy_codec, normalize_codec};
use crate::media::MediaStream;

/// Ceiling for any target bitrate, leaving room for `-bufsize = 2 * bitrate`.
pub const MAX_TARGET_BITRATE: u32 = (i32::MAX / 2) as u32;

/// Relative bitrate needed by `codec` for the same quality as H.264.
pub fn video_bitrate_scale_factor(codec: Option<&str>) -> f64 {
    match codec.map(normalize_codec).as_deref() {
        Some("hevc") | Some("vp9") => 0.6,
        Some("av1") => 0.5,
        _ => 1.0,
    }
}

/// Rescales `bitrate` from `input_codec` efficiency to `output_codec` efficiency.
///
/// The result is never below `bitrate`; very low bitrates get an extra floor
/// multiplier since they otherwise look terrible after a re-encode.
pub fn scale_bitrate(bitrate: u32, input_codec: Option<&str>, output_codec: Option<&str>) -> u32 {
    let input_factor = video_bitrate_scale_factor(input_codec);
    let output_factor = video_bitrate_scale_factor(output_codec);
    let mut scale_factor = (output_factor / input_factor).max(1.0);

    let floor = match bitrate {
        0..=500_000 => 4.0,
        500_001..=1_000_000 => 3.0,
        1_000_001..=2_000_000 => 2.5,
        2_000_001..=3_000_000 => 2.0,
        _ => 1.0,
    };
    scale_factor = scale_factor.max(floor);

    (scale_factor * bitrate as f64)
        .round()
        .min(u32::MAX as f64) as u32
}

/// Lower of the (boosted) source bitrate and the requested bitrate.
fn min_bitrate(source_bitrate: u32, requested_bitrate: u32) -> u32 {
    let source = match source_bitrate {
        0..=2_000_000 => (source_bitrate as f64 * 2.5).round() as u32,
        2_000_001..=3_000_000 => source_bitrate.saturating_mul(2),
        _ => source_bitrate,
    };
    source.min(requested_bitrate)
}

/// Target video bitrate for a transcode.
///
/// Unless the request upscales in both dimensions, the output never exceeds
/// what the source can justify after codec-efficiency scaling, and it is
/// always capped at the requested bitrate and [`MAX_TARGET_BITRATE`].
pub fn video_bitrate_param_value(
    request: &BaseEncodingJobOptions,
    video_stream: Option<&MediaStream>,
    output_video_codec: Option<&str>,
) -> Option<u32> {
    let mut bitrate = request.video_bit_rate;

    if let Some(stream) = video_stream {
        let is_upscaling = matches!(
            (request.width, request.height, stream.width, stream.height),
            (Some(rw), Some(rh), Some(sw), Some(sh)) if rw > sw && rh > sh
        );

        if !is_upscaling {
            if let (Some(requested), Some(source)) = (bitrate, stream.bit_rate) {
                bitrate = Some(min_bitrate(source, requested));
            }

            if let Some(current) = bitrate {
                let mut scaled =
                    scale_bitrate(current, stream.codec.as_deref(), output_video_codec);
                if let Some(requested) = request.video_bit_rate {
                    scaled = scaled.min(requested);
                }
                bitrate = Some(scaled);
            }
        }
    }

    bitrate
        .map(|b| b.min(MAX_TARGET_BITRATE))
        .filter(|b| *b > 0)
}

/// Target audio bitrate for `audio_codec`.
///
/// Surround sources keep a surround-sized budget; otherwise the budget is
/// per output (or input) channel. Always capped at `requested_bitrate`.
pub fn audio_bitrate_param(
    requested_bitrate: Option<u32>,
    audio_codec: Option<&str>,
    audio_stream: Option<&MediaStream>,
    output_channels: Option<u32>,
) -> Option<u32> {
    let stream = audio_stream?;
    let input_channels = stream.channels.unwrap_or(0);
    let output = output_channels.unwrap_or(0);
    let cap = requested_bitrate.unwrap_or(u32::MAX);

    let codec = audio_codec.map(normalize_codec).unwrap_or_default();
    let budget = |surround: u32, per_channel: u32, fallback: u32| {
        let value = match (input_channels, output) {
            (i, o) if i >= 6 && (o >= 6 || o == 0) => surround,
            (i, o) if i > 0 && o > 0 => o * per_channel,
            (i, _) if i > 0 => i * per_channel,
            _ => fallback,
        };
        value.min(cap)
    };

    match codec.as_str() {
        "" | "aac" | "mp3" | "opus" | "vorbis" | "ac3" | "eac3" => {
            Some(budget(640_000, 128_000, 384_000))
        }
        "dts" | "truehd" => Some(budget(768_000, 136_000, 672_000)),
        _ => Some(128_000 * output_channels.or(stream.channels).unwrap_or(2)),
    }
}

/// ffmpeg encoder for an output audio codec.
pub fn audio_encoder_for(codec: &str) -> String {
    let codec = codec.trim().to_ascii_lowercase();
    match codec.as_str() {
        "aac" => "aac".to_string(),
        "mp3" => "libmp3lame".to_string(),
        "vorbis" => "libvorbis".to_string(),
        "opus" => "libopus".to_string(),
        "flac" => "flac".to_string(),
        "dts" => "dca".to_string(),
        "alac" => "alac".to_string(),
        _ => codec,
    }
}

/// Maximum channels an audio encoder can produce.
fn encoder_channel_limit(encoder: &str) -> u32 {
    match encoder {
        "libmp3lame" => 2,
        "libfdk_aac" | "ac3" | "eac3" | "dca" | "mlp" | "truehd" => 6,
        _ => 8,
    }
}

/// Output channel count for the selected audio stream.
///
/// Segmented outputs avoid 3-5 and 7 channel layouts, which Apple's HLS
/// authoring rules do not allow.
pub fn audio_channels_param(
    request: &BaseEncodingJobOptions,
    audio_stream: Option<&MediaStream>,
    output_audio_codec: Option<&str>,
    is_progressive: bool,
) -> Option<u32> {
    let stream = audio_stream?;
    let codec = output_audio_codec.unwrap_or_default();

    let mut channels = request.requested_audio_channels(codec);
    if let Some(input) = stream.channels.filter(|c| *c > 0) {
        channels = Some(channels.map_or(input, |requested| requested.min(input)));
    }

    if is_copy_codec(output_audio_codec) {
        return channels;
    }

    let limit = encoder_channel_limit(&audio_encoder_for(codec));
    let mut channels = channels.map_or(limit, |c| c.min(limit));
    if let Some(max) = request.transcoding_max_audio_channels {
        channels = channels.min(max);
    }

    if !is_progressive {
        channels = match channels {
            3..=5 => 6,
            7 => 8,
            other => other,
        };
    }
    Some(channels)
}
