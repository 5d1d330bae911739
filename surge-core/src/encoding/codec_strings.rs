//! RFC 6381 `CODECS` attribute values for HLS master playlists.

use tracing::warn;

use crate::encoding::job_info::EncodingJobInfo;
use crate::encoding::normalize_codec;

pub fn mp3_string() -> &'static str {
    "mp4a.40.34"
}

/// AAC-LC unless the profile names HE-AAC.
pub fn aac_string(profile: Option<&str>) -> &'static str {
    if profile.is_some_and(|p| p.to_ascii_uppercase().contains("HE")) {
        "mp4a.40.5"
    } else {
        "mp4a.40.2"
    }
}

pub fn h264_string(profile: Option<&str>, level: u32) -> String {
    let profile_id = match profile.map(compact_lower).as_deref() {
        Some("high") => "6400",
        Some("main") => "4D40",
        Some("baseline") => "42E0",
        _ => "4240",
    };
    format!("avc1.{profile_id}{level:02X}")
}

pub fn h265_string(profile: Option<&str>, level: u32) -> String {
    let profile_id = match profile.map(compact_lower).as_deref() {
        Some("main10") => "2.4",
        _ => "1.4",
    };
    format!("hvc1.{profile_id}.L{level}.B0")
}

/// `av01.<profile>.<level><tier>.<bitdepth>`
pub fn av1_string(profile: Option<&str>, level: u32, high_tier: bool, bit_depth: u32) -> String {
    let profile_id = match profile.map(compact_lower).as_deref() {
        Some("high") => 1,
        Some("professional") => 2,
        _ => 0,
    };
    // Out-of-range levels fall back to 6.3, the highest defined level
    let level = if level == 0 || level > 31 { 19 } else { level };
    let bit_depth = if bit_depth == 10 { 10 } else { 8 };
    let tier = if high_tier { 'H' } else { 'M' };
    format!("av01.{profile_id}.{level:02}{tier}.{bit_depth:02}")
}

/// `vp09.<profile>.<level>.<bitdepth>` derived from the stream itself.
pub fn vp9_string(
    width: u32,
    height: u32,
    pixel_format: Option<&str>,
    framerate: f32,
    bit_depth: u32,
) -> String {
    let is_444 = pixel_format.is_some_and(|fmt| fmt.contains("444"));
    let profile = match (is_444, bit_depth > 8) {
        (false, false) => 0,
        (true, false) => 1,
        (false, true) => 2,
        (true, true) => 3,
    };

    let samples = width as u64 * height as u64;
    let level = match samples {
        0..=36_864 => 10,
        36_865..=73_728 => 11,
        73_729..=122_880 => 20,
        122_881..=245_760 => 21,
        245_761..=552_960 => 30,
        552_961..=983_040 => 31,
        983_041..=2_228_224 if framerate <= 30.0 => 40,
        983_041..=2_228_224 => 41,
        2_228_225..=8_912_896 if framerate <= 30.0 => 50,
        2_228_225..=8_912_896 if framerate <= 60.0 => 51,
        2_228_225..=8_912_896 => 52,
        _ => 60,
    };
    let bit_depth = if bit_depth > 8 { bit_depth } else { 8 };
    format!("vp09.{profile:02}.{level}.{bit_depth:02}")
}

fn compact_lower(value: &str) -> String {
    value.replace(' ', "").to_ascii_lowercase()
}

/// Numeric codec level of the output as it appears in the playlist.
///
/// Copies report the source level; transcodes report the requested level
/// or a conservative default.
pub fn output_video_level(job: &EncodingJobInfo) -> Option<u32> {
    if job.is_video_copy() {
        return job
            .video_stream
            .as_ref()
            .and_then(|s| s.level)
            .filter(|level| *level > 0.0)
            .map(|level| level.round() as u32);
    }

    let codec = normalize_codec(&job.actual_output_video_codec()?);
    let requested = job.base_request.requested_level(&codec);
    let level = match codec.as_str() {
        "h264" => requested.unwrap_or(41.0),
        "hevc" => requested.unwrap_or(120.0),
        "av1" => requested.unwrap_or(19.0),
        _ => return None,
    };
    Some(level.round() as u32)
}

/// Profile string used in the codec tag.
fn output_video_profile(job: &EncodingJobInfo) -> Option<String> {
    job.target_video_profile().map(|p| compact_lower(&p))
}

/// Video part of the `CODECS` attribute, or `None` when it cannot be stated.
pub fn playlist_video_codec(job: &EncodingJobInfo) -> Option<String> {
    let codec = normalize_codec(&job.actual_output_video_codec()?);
    let profile = output_video_profile(job);

    if codec == "vp9" {
        let stream = job.video_stream.as_ref()?;
        return Some(vp9_string(
            stream.width.unwrap_or(0),
            stream.height.unwrap_or(0),
            stream.pixel_format.as_deref(),
            stream.reference_frame_rate().unwrap_or(30.0),
            stream.bit_depth.unwrap_or(8),
        ));
    }

    let Some(level) = output_video_level(job).filter(|level| *level > 0) else {
        warn!("No usable video level for the CODECS attribute of {}", job.media_path);
        return None;
    };

    match codec.as_str() {
        "h264" => Some(h264_string(profile.as_deref(), level)),
        "hevc" => Some(h265_string(profile.as_deref(), level)),
        "av1" => {
            let bit_depth = job
                .target_video_bit_depth()
                .or_else(|| job.video_stream.as_ref().and_then(|s| s.bit_depth))
                .unwrap_or(8);
            Some(av1_string(profile.as_deref(), level, false, bit_depth))
        }
        _ => None,
    }
}

/// Audio part of the `CODECS` attribute.
pub fn playlist_audio_codec(job: &EncodingJobInfo) -> Option<String> {
    let codec = normalize_codec(&job.actual_output_audio_codec()?);
    let value = match codec.as_str() {
        "aac" => {
            let profile = if job.is_audio_copy() {
                job.audio_stream.as_ref().and_then(|s| s.profile.clone())
            } else {
                job.base_request.requested_profiles("aac").into_iter().next()
            };
            aac_string(profile.as_deref())
        }
        "mp3" => mp3_string(),
        "ac3" => "ac-3",
        "eac3" => "ec-3",
        "flac" => "fLaC",
        "alac" => "alac",
        "opus" => "Opus",
        _ => return None,
    };
    Some(value.to_string())
}

/// Full `CODECS` attribute value, video first.
pub fn playlist_codecs(job: &EncodingJobInfo) -> Option<String> {
    let parts: Vec<String> = [playlist_video_codec(job), playlist_audio_codec(job)]
        .into_iter()
        .flatten()
        .collect();
    (!parts.is_empty()).then(|| parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::job_info::TranscodingJobType;
    use crate::encoding::options::BaseEncodingJobOptions;
    use crate::media::{MediaStream, MediaStreamType};

    #[test]
    fn test_video_codec_strings() {
        assert_eq!(h264_string(Some("High"), 41), "avc1.640029");
        assert_eq!(h264_string(Some("main"), 40), "avc1.4D4028");
        assert_eq!(h264_string(Some("constrained baseline"), 30), "avc1.42401E");
        assert_eq!(h265_string(Some("Main 10"), 150), "hvc1.2.4.L150.B0");
        assert_eq!(h265_string(None, 120), "hvc1.1.4.L120.B0");
        assert_eq!(av1_string(Some("main"), 8, false, 10), "av01.0.08M.10");
        assert_eq!(av1_string(None, 0, true, 12), "av01.0.19H.08");
        assert_eq!(vp9_string(1920, 1080, Some("yuv420p"), 24.0, 8), "vp09.00.40.08");
        assert_eq!(vp9_string(3840, 2160, Some("yuv420p10le"), 60.0, 10), "vp09.02.51.10");
    }

    #[test]
    fn test_audio_codec_strings() {
        assert_eq!(aac_string(Some("HE-AAC")), "mp4a.40.5");
        assert_eq!(aac_string(Some("LC")), "mp4a.40.2");
        assert_eq!(mp3_string(), "mp4a.40.34");
    }

    #[test]
    fn test_playlist_codecs_for_transcode_and_copy() {
        let mut job = EncodingJobInfo::new(BaseEncodingJobOptions::default(), TranscodingJobType::Hls);
        job.video_stream = Some(MediaStream {
            codec: Some("hevc".to_string()),
            profile: Some("Main 10".to_string()),
            level: Some(153.0),
            ..Default::default()
        });
        job.audio_stream = Some(MediaStream {
            stream_type: MediaStreamType::Audio,
            codec: Some("eac3".to_string()),
            ..Default::default()
        });

        job.output_video_codec = Some("h264".to_string());
        job.output_audio_codec = Some("aac".to_string());
        assert_eq!(playlist_codecs(&job).as_deref(), Some("avc1.424029,mp4a.40.2"));

        job.output_video_codec = Some("copy".to_string());
        job.output_audio_codec = Some("copy".to_string());
        assert_eq!(playlist_codecs(&job).as_deref(), Some("hvc1.2.4.L153.B0,ec-3"));
    }
}
