//! Encoding negotiation engine.
//!
//! Turns a client request plus probed source metadata into a concrete encode
//! plan ([`EncodingJobInfo`]) and assembles the ffmpeg argument list for it.
//! Everything in here is decision logic over plain data; the only I/O is the
//! optional capability probe in [`hwaccel`].

pub mod args;
pub mod bitrate;
pub mod codec_strings;
pub mod filters;
pub mod hwaccel;
pub mod job_info;
pub mod negotiate;
pub mod options;
pub mod resolution;

pub use args::{CommandLineBuilder, FfmpegArgs};
pub use filters::{FilterChain, build_filter_chain};
pub use hwaccel::{HardwareAccelerationType, HardwareCapabilities, Platform, select_backend};
pub use job_info::{EncodingJobInfo, TranscodingJobType};
pub use negotiate::{NegotiationContext, attach_media_source_info, negotiate, try_stream_copy};
pub use options::{BaseEncodingJobOptions, EncodingContext, SubtitleDeliveryMethod};

/// Errors raised while negotiating an encode plan.
///
/// All variants describe a request that cannot be satisfied as asked, so
/// callers surface them as client errors and never retry.
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("No usable media stream: {reason}")]
    NoMediaStreams { reason: String },

    #[error("Unsupported codec: {codec}")]
    UnsupportedCodec { codec: String },

    #[error("No media source attached to the encoding job")]
    MissingMediaSource,
}

/// Whether `codec` means passthrough.
pub fn is_copy_codec(codec: Option<&str>) -> bool {
    codec.is_some_and(|c| c.eq_ignore_ascii_case("copy"))
}

/// Canonical lowercase codec name, folding aliases.
pub fn normalize_codec(codec: &str) -> String {
    let codec = codec.trim().to_ascii_lowercase();
    match codec.as_str() {
        "h265" | "hev1" | "hvc1" => "hevc".to_string(),
        "avc" | "avc1" => "h264".to_string(),
        "dca" => "dts".to_string(),
        "mlp" => "truehd".to_string(),
        _ => codec,
    }
}

/// Segment file extension for an HLS segment container.
pub fn segment_file_extension(segment_container: &str) -> &'static str {
    match segment_container.trim().trim_start_matches('.') {
        "mp4" | "fmp4" | "m4s" => ".mp4",
        _ => ".ts",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_helpers() {
        assert!(is_copy_codec(Some("COPY")));
        assert!(!is_copy_codec(None));
        assert_eq!(normalize_codec("H265"), "hevc");
        assert_eq!(normalize_codec("aac"), "aac");
        assert_eq!(segment_file_extension("mp4"), ".mp4");
        assert_eq!(segment_file_extension("ts"), ".ts");
        assert_eq!(segment_file_extension("mpegts"), ".ts");
    }
}
