//! VOD media playlist generation.

use std::fmt::Write as _;
use std::path::Path;

use super::{CreateMainPlaylistRequest, PlaylistError};
use crate::encoding::segment_file_extension;
use crate::keyframes::KeyframeData;
use crate::ticks::{TICKS_PER_MILLISECOND, seconds_to_ticks, ticks_to_seconds};

/// Whether keyframe extraction is permitted for `file_path`.
pub fn is_extraction_allowed_for_file(file_path: &str, allowed_extensions: &[String]) -> bool {
    let Some(extension) = Path::new(file_path).extension().and_then(|e| e.to_str()) else {
        return false;
    };
    allowed_extensions
        .iter()
        .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(extension))
}

fn desired_length_ticks(desired_segment_length_ms: i64) -> Result<i64, PlaylistError> {
    if desired_segment_length_ms <= 0 {
        return Err(PlaylistError::InvalidSegmentLength {
            reason: format!("{desired_segment_length_ms}ms"),
        });
    }
    Ok(desired_segment_length_ms * TICKS_PER_MILLISECOND)
}

/// Segment lengths in seconds, cut at the first keyframe at or after each boundary.
///
/// The final segment runs from the last cut to the end of the media.
pub fn compute_segments_from_keyframes(
    keyframes: &KeyframeData,
    desired_segment_length_ms: i64,
) -> Result<Vec<f64>, PlaylistError> {
    let desired = desired_length_ticks(desired_segment_length_ms)?;
    let total = keyframes.total_duration_ticks;
    if let Some(last) = keyframes.keyframe_ticks.last() {
        if total < *last {
            return Err(PlaylistError::KeyframesBeyondDuration {
                reason: format!("last keyframe at {last} ticks, duration {total} ticks"),
            });
        }
    }

    let mut segments = Vec::new();
    let mut desired_cut = desired;
    let mut last_cut = 0;
    for &keyframe in &keyframes.keyframe_ticks {
        if keyframe >= desired_cut {
            segments.push(ticks_to_seconds(keyframe - last_cut));
            last_cut = keyframe;
            desired_cut += desired;
        }
    }
    segments.push(ticks_to_seconds(total - last_cut));
    Ok(segments)
}

/// Equal-length segments in seconds; the remainder becomes a shorter final segment.
pub fn compute_equal_length_segments(
    desired_segment_length_ms: i64,
    total_runtime_ticks: i64,
) -> Result<Vec<f64>, PlaylistError> {
    let desired = desired_length_ticks(desired_segment_length_ms)?;
    let total = total_runtime_ticks.max(0);
    let whole = total / desired;
    let remainder = total % desired;

    let mut segments = vec![ticks_to_seconds(desired); whole as usize];
    if remainder > 0 {
        segments.push(ticks_to_seconds(remainder));
    }
    Ok(segments)
}

/// Renders the media playlist for `request`.
///
/// `keyframes` is only used for stream copies; re-encodes place keyframes
/// themselves and always get equal-length segments.
pub fn create_main_playlist(
    request: &CreateMainPlaylistRequest,
    keyframes: Option<&KeyframeData>,
) -> Result<String, PlaylistError> {
    let segments = match keyframes {
        Some(keyframes) if request.is_remuxing_video && !keyframes.keyframe_ticks.is_empty() => {
            compute_segments_from_keyframes(keyframes, request.desired_segment_length_ms)?
        }
        _ => compute_equal_length_segments(
            request.desired_segment_length_ms,
            request.total_runtime_ticks,
        )?,
    };

    let extension = segment_file_extension(&request.segment_container);
    let is_fmp4 = extension == ".mp4";
    let query = normalize_query(&request.query_string);
    let separator = if query.is_empty() { '?' } else { '&' };

    let target_duration = segments
        .iter()
        .copied()
        .reduce(f64::max)
        .unwrap_or(request.desired_segment_length_ms as f64 / 1000.0)
        .ceil() as i64;

    let mut playlist = String::with_capacity(128 + segments.len() * 96);
    playlist.push_str("#EXTM3U\n");
    playlist.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
    let _ = writeln!(playlist, "#EXT-X-VERSION:{}", if is_fmp4 { 7 } else { 3 });
    let _ = writeln!(playlist, "#EXT-X-TARGETDURATION:{target_duration}");
    playlist.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");

    if is_fmp4 {
        let _ = writeln!(
            playlist,
            "#EXT-X-MAP:URI=\"{}-1{extension}{query}{separator}runtimeTicks=0&actualSegmentLengthTicks=0\"",
            request.endpoint_prefix
        );
    }

    let mut runtime_ticks = 0i64;
    for (index, length) in segments.iter().enumerate() {
        let length_ticks = seconds_to_ticks(*length);
        let _ = writeln!(playlist, "#EXTINF:{length:.6}, nodesc");
        let _ = writeln!(
            playlist,
            "{}{index}{extension}{query}{separator}runtimeTicks={runtime_ticks}&actualSegmentLengthTicks={length_ticks}",
            request.endpoint_prefix
        );
        runtime_ticks += length_ticks;
    }

    playlist.push_str("#EXT-X-ENDLIST\n");
    Ok(playlist)
}

fn normalize_query(query: &str) -> String {
    let query = query.trim();
    if query.is_empty() || query == "?" {
        String::new()
    } else if query.starts_with('?') {
        query.to_string()
    } else {
        format!("?{query}")
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::ticks::TICKS_PER_SECOND;

    fn request(container: &str, remux: bool) -> CreateMainPlaylistRequest {
        CreateMainPlaylistRequest {
            file_path: "/media/movie.mkv".to_string(),
            desired_segment_length_ms: 5000,
            total_runtime_ticks: 125_000_000,
            segment_container: container.to_string(),
            endpoint_prefix: "hls1/main/".to_string(),
            query_string: "?PlaySessionId=abc".to_string(),
            is_remuxing_video: remux,
        }
    }

    #[test]
    fn test_equal_length_segments_keep_remainder() {
        assert_eq!(
            compute_equal_length_segments(5000, 125_000_000).unwrap(),
            vec![5.0, 5.0, 2.5]
        );
        assert_eq!(compute_equal_length_segments(5000, 100_000_000).unwrap(), vec![5.0, 5.0]);
        assert!(compute_equal_length_segments(0, 100).is_err());
    }

    #[test]
    fn test_keyframe_segments_cut_at_or_after_boundaries() {
        let keyframes = KeyframeData::new(
            vec![5 * TICKS_PER_SECOND, 102_000_000, 15 * TICKS_PER_SECOND],
            18 * TICKS_PER_SECOND,
        );
        let segments = compute_segments_from_keyframes(&keyframes, 5000).unwrap();
        let expected = [5.0, 5.2, 4.8, 3.0];
        assert_eq!(segments.len(), expected.len());
        for (actual, expected) in segments.iter().zip(expected) {
            assert!((actual - expected).abs() < 1e-9, "{actual} != {expected}");
        }
    }

    #[test]
    fn test_keyframes_past_duration_fail() {
        let keyframes = KeyframeData::new(vec![20 * TICKS_PER_SECOND], 18 * TICKS_PER_SECOND);
        assert!(matches!(
            compute_segments_from_keyframes(&keyframes, 5000),
            Err(PlaylistError::KeyframesBeyondDuration { .. })
        ));
    }

    #[test]
    fn test_ts_playlist_layout() {
        let playlist = create_main_playlist(&request("ts", false), None).unwrap();
        let lines: Vec<&str> = playlist.lines().collect();
        assert_eq!(
            lines,
            vec![
                "#EXTM3U",
                "#EXT-X-PLAYLIST-TYPE:VOD",
                "#EXT-X-VERSION:3",
                "#EXT-X-TARGETDURATION:5",
                "#EXT-X-MEDIA-SEQUENCE:0",
                "#EXTINF:5.000000, nodesc",
                "hls1/main/0.ts?PlaySessionId=abc&runtimeTicks=0&actualSegmentLengthTicks=50000000",
                "#EXTINF:5.000000, nodesc",
                "hls1/main/1.ts?PlaySessionId=abc&runtimeTicks=50000000&actualSegmentLengthTicks=50000000",
                "#EXTINF:2.500000, nodesc",
                "hls1/main/2.ts?PlaySessionId=abc&runtimeTicks=100000000&actualSegmentLengthTicks=25000000",
                "#EXT-X-ENDLIST",
            ]
        );
    }

    #[test]
    fn test_fmp4_playlist_has_map_and_version_7() {
        let mut req = request("mp4", false);
        req.query_string = String::new();
        let playlist = create_main_playlist(&req, None).unwrap();
        assert!(playlist.contains("#EXT-X-VERSION:7\n"));
        assert!(playlist.contains(
            "#EXT-X-MAP:URI=\"hls1/main/-1.mp4?runtimeTicks=0&actualSegmentLengthTicks=0\"\n"
        ));
        assert!(playlist.contains("hls1/main/0.mp4?runtimeTicks=0&"));
    }

    #[test]
    fn test_keyframes_only_used_when_remuxing() {
        let keyframes = KeyframeData::new(vec![0, 70_000_000], 125_000_000);
        let transcode = create_main_playlist(&request("ts", false), Some(&keyframes)).unwrap();
        assert!(transcode.contains("#EXT-X-TARGETDURATION:5\n"));

        let remux = create_main_playlist(&request("ts", true), Some(&keyframes)).unwrap();
        assert!(remux.contains("#EXTINF:7.000000, nodesc"));
        assert!(remux.contains("#EXT-X-TARGETDURATION:7\n"));
    }

    #[test]
    fn test_extension_allow_list() {
        let allowed = vec!["mkv".to_string(), ".mp4".to_string()];
        assert!(is_extraction_allowed_for_file("/a/b.MKV", &allowed));
        assert!(is_extraction_allowed_for_file("/a/b.mp4", &allowed));
        assert!(!is_extraction_allowed_for_file("/a/b.avi", &allowed));
        assert!(!is_extraction_allowed_for_file("/a/noext", &allowed));
    }

    proptest! {
        #[test]
        fn test_equal_length_segments_cover_runtime(
            desired_ms in 1_000i64..20_000,
            total_ticks in 0i64..(4 * 3600 * TICKS_PER_SECOND),
        ) {
            let segments = compute_equal_length_segments(desired_ms, total_ticks).unwrap();
            let sum: i64 = segments.iter().map(|s| seconds_to_ticks(*s)).sum();
            prop_assert_eq!(sum, total_ticks);
            let desired = desired_ms * TICKS_PER_MILLISECOND;
            prop_assert!(segments.iter().all(|s| seconds_to_ticks(*s) <= desired));
        }
    }
}
