//! Tick arithmetic.
//!
//! All media positions inside the engine are expressed in ticks of 100ns so
//! that segment boundaries and seek offsets stay exact across conversions.

/// Number of ticks in one second.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Number of ticks in one millisecond.
pub const TICKS_PER_MILLISECOND: i64 = 10_000;

/// Converts seconds to ticks, rounding to the nearest tick.
pub fn seconds_to_ticks(seconds: f64) -> i64 {
    (seconds * TICKS_PER_SECOND as f64).round() as i64
}

/// Converts ticks to fractional seconds.
pub fn ticks_to_seconds(ticks: i64) -> f64 {
    ticks as f64 / TICKS_PER_SECOND as f64
}

pub fn millis_to_ticks(millis: i64) -> i64 {
    millis * TICKS_PER_MILLISECOND
}

/// Formats a tick offset the way ffmpeg expects `-ss` values: `HH:MM:SS.fff`.
///
/// Negative offsets clamp to zero.
pub fn format_ffmpeg_time(ticks: i64) -> String {
    let ticks = ticks.max(0);
    let total_millis = ticks / TICKS_PER_MILLISECOND;
    let hours = total_millis / 3_600_000;
    let minutes = (total_millis / 60_000) % 60;
    let seconds = (total_millis / 1000) % 60;
    let millis = total_millis % 1000;

    format!("{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
}

/// Parses an ffmpeg `HH:MM:SS.ff` timestamp into ticks.
pub fn parse_ffmpeg_time(value: &str) -> Option<i64> {
    let value = value.trim();
    // ffmpeg prints negative times while priming the muxer
    if value.starts_with('-') {
        return None;
    }

    let mut parts = value.splitn(3, ':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;

    Some(hours * 3600 * TICKS_PER_SECOND + minutes * 60 * TICKS_PER_SECOND + seconds_to_ticks(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_roundtrip_is_exact_for_decimal_values() {
        assert_eq!(seconds_to_ticks(10.2), 102_000_000);
        assert_eq!(ticks_to_seconds(25_000_000), 2.5);
        assert_eq!(millis_to_ticks(5000), 50_000_000);
    }

    #[test]
    fn test_format_ffmpeg_time() {
        assert_eq!(format_ffmpeg_time(0), "00:00:00.000");
        assert_eq!(format_ffmpeg_time(seconds_to_ticks(3725.5)), "01:02:05.500");
        assert_eq!(format_ffmpeg_time(-5), "00:00:00.000");
    }

    #[test]
    fn test_parse_ffmpeg_time() {
        assert_eq!(parse_ffmpeg_time("00:01:02.50"), Some(seconds_to_ticks(62.5)));
        assert_eq!(parse_ffmpeg_time("garbage"), None);
        assert_eq!(parse_ffmpeg_time("-00:00:01.00"), None);
    }
}
