//! Centralized configuration for Surge.
//!
//! Server-side encoding policy and control-loop timings live here so the
//! negotiation engine and supervisor never reach for hard-coded values.

use std::path::PathBuf;
use std::time::Duration;

use crate::encoding::hwaccel::HardwareAccelerationType;

/// Central configuration for all Surge components.
#[derive(Debug, Clone, Default)]
pub struct SurgeConfig {
    pub encoding: EncodingOptions,
    pub hls: HlsConfig,
    pub supervisor: SupervisorConfig,
    pub server: ServerConfig,
}

/// Server-side encoding policy applied on top of every client request.
#[derive(Debug, Clone)]
pub struct EncodingOptions {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    /// Directory receiving playlists, segments and transcode logs
    pub transcode_dir: PathBuf,
    /// `-threads` value; 0 lets ffmpeg decide
    pub encoding_thread_count: u32,
    pub enable_throttling: bool,
    pub throttle_delay_seconds: u64,
    pub enable_segment_deletion: bool,
    pub segment_keep_seconds: u64,
    pub hardware_acceleration: HardwareAccelerationType,
    pub vaapi_device: String,
    pub qsv_device: Option<String>,
    pub enable_hardware_encoding: bool,
    /// Source codecs the hardware decoder may be used for
    pub hardware_decoding_codecs: Vec<String>,
    pub enable_decoding_color_depth_10_hevc: bool,
    pub enable_decoding_color_depth_10_vp9: bool,
    pub enable_tonemapping: bool,
    pub tonemapping_algorithm: String,
    pub tonemapping_peak: f64,
    pub tonemapping_desat: f64,
    /// `yadif` or `bwdif`
    pub deinterlace_method: String,
    pub deinterlace_double_rate: bool,
    pub encoder_preset: String,
    pub h264_crf: u32,
    pub h265_crf: u32,
    pub allow_hevc_encoding: bool,
    pub allow_av1_encoding: bool,
    /// File extensions for which keyframe-aligned playlists may be built
    pub keyframe_extraction_extensions: Vec<String>,
    pub max_muxing_queue_size: u32,
    pub downmix_audio_boost: f64,
    /// Whether the transcoder understands the dedicated `p`/`u` pause keys
    pub pause_key_supported: bool,
}

impl Default for EncodingOptions {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            transcode_dir: std::env::temp_dir().join("surge-transcodes"),
            encoding_thread_count: 0,
            enable_throttling: false,
            throttle_delay_seconds: 180,
            enable_segment_deletion: false,
            segment_keep_seconds: 720, // 12 minutes
            hardware_acceleration: HardwareAccelerationType::None,
            vaapi_device: "/dev/dri/renderD128".to_string(),
            qsv_device: None,
            enable_hardware_encoding: true,
            hardware_decoding_codecs: ["h264", "hevc", "vp9", "av1"]
                .into_iter()
                .map(String::from)
                .collect(),
            enable_decoding_color_depth_10_hevc: true,
            enable_decoding_color_depth_10_vp9: true,
            enable_tonemapping: false,
            tonemapping_algorithm: "bt2390".to_string(),
            tonemapping_peak: 100.0,
            tonemapping_desat: 0.0,
            deinterlace_method: "yadif".to_string(),
            deinterlace_double_rate: false,
            encoder_preset: "veryfast".to_string(),
            h264_crf: 23,
            h265_crf: 28,
            allow_hevc_encoding: false,
            allow_av1_encoding: false,
            keyframe_extraction_extensions: vec!["mkv".to_string()],
            max_muxing_queue_size: 2048,
            downmix_audio_boost: 2.0,
            pause_key_supported: true,
        }
    }
}

impl EncodingOptions {
    /// Throttle threshold with the 60 second floor applied.
    pub fn effective_throttle_delay(&self) -> Duration {
        Duration::from_secs(self.throttle_delay_seconds.max(60))
    }

    /// Segment keep window with the 20 second floor applied.
    pub fn effective_segment_keep_seconds(&self) -> u64 {
        self.segment_keep_seconds.max(20)
    }
}

/// HLS packaging defaults used when the request leaves them out.
#[derive(Debug, Clone)]
pub struct HlsConfig {
    /// Segment length in seconds
    pub default_segment_length: u32,
    pub default_min_segments: u32,
    /// `ts` or `mp4`
    pub default_segment_container: String,
    pub enable_adaptive_bitrate_streaming: bool,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            default_segment_length: 6,
            default_min_segments: 1,
            default_segment_container: "ts".to_string(),
            enable_adaptive_bitrate_streaming: true,
        }
    }
}

/// Job lifecycle and control-loop timings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How long a quit command may take before the process is killed
    pub graceful_stop_timeout: Duration,
    pub hls_idle_timeout: Duration,
    pub progressive_idle_timeout: Duration,
    /// Sleep between segment availability checks
    pub segment_poll_interval: Duration,
    pub throttle_interval: Duration,
    pub cleaner_interval: Duration,
    /// Delay before deleting segments, leaving in-flight reads time to finish
    pub cleaner_delete_delay: Duration,
    /// Seconds of look-ahead a client may skip before a restart is cheaper
    pub restart_gap_seconds: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            graceful_stop_timeout: Duration::from_secs(5),
            hls_idle_timeout: Duration::from_secs(60),
            progressive_idle_timeout: Duration::from_secs(10),
            segment_poll_interval: Duration::from_millis(100),
            throttle_interval: Duration::from_secs(5),
            cleaner_interval: Duration::from_secs(20),
            cleaner_delete_delay: Duration::from_millis(1500),
            restart_gap_seconds: 24,
        }
    }
}

/// HTTP front-end settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub media_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8096,
            media_dir: PathBuf::from("media"),
        }
    }
}

impl SurgeConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Values that fail to parse leave the default in place.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("SURGE_FFMPEG_PATH") {
            config.encoding.ffmpeg_path = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("SURGE_FFPROBE_PATH") {
            config.encoding.ffprobe_path = PathBuf::from(path);
        }

        if let Ok(dir) = std::env::var("SURGE_TRANSCODE_DIR") {
            config.encoding.transcode_dir = PathBuf::from(dir);
        }

        if let Ok(dir) = std::env::var("SURGE_MEDIA_DIR") {
            config.server.media_dir = PathBuf::from(dir);
        }

        if let Ok(port) = std::env::var("SURGE_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                config.server.port = port;
            }
        }

        if let Ok(enabled) = std::env::var("SURGE_ENABLE_THROTTLING") {
            if let Ok(enabled) = enabled.parse::<bool>() {
                config.encoding.enable_throttling = enabled;
            }
        }

        if let Ok(delay) = std::env::var("SURGE_THROTTLE_DELAY_SECONDS") {
            if let Ok(seconds) = delay.parse::<u64>() {
                config.encoding.throttle_delay_seconds = seconds;
            }
        }

        if let Ok(enabled) = std::env::var("SURGE_ENABLE_SEGMENT_DELETION") {
            if let Ok(enabled) = enabled.parse::<bool>() {
                config.encoding.enable_segment_deletion = enabled;
            }
        }

        if let Ok(keep) = std::env::var("SURGE_SEGMENT_KEEP_SECONDS") {
            if let Ok(seconds) = keep.parse::<u64>() {
                config.encoding.segment_keep_seconds = seconds;
            }
        }

        if let Ok(hwaccel) = std::env::var("SURGE_HWACCEL") {
            if let Ok(kind) = hwaccel.parse::<HardwareAccelerationType>() {
                config.encoding.hardware_acceleration = kind;
            }
        }

        if let Ok(device) = std::env::var("SURGE_VAAPI_DEVICE") {
            config.encoding.vaapi_device = device;
        }

        if let Ok(allow) = std::env::var("SURGE_ALLOW_HEVC_ENCODING") {
            if let Ok(allow) = allow.parse::<bool>() {
                config.encoding.allow_hevc_encoding = allow;
            }
        }

        if let Ok(allow) = std::env::var("SURGE_ALLOW_AV1_ENCODING") {
            if let Ok(allow) = allow.parse::<bool>() {
                config.encoding.allow_av1_encoding = allow;
            }
        }

        if let Ok(length) = std::env::var("SURGE_SEGMENT_LENGTH") {
            if let Ok(seconds) = length.parse::<u32>() {
                if seconds > 0 {
                    config.hls.default_segment_length = seconds;
                }
            }
        }

        config
    }

    /// Short timings for tests; transcodes land in `transcode_dir`.
    pub fn for_testing(transcode_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.encoding.transcode_dir = transcode_dir.into();
        config.supervisor = SupervisorConfig {
            graceful_stop_timeout: Duration::from_millis(200),
            hls_idle_timeout: Duration::from_millis(500),
            progressive_idle_timeout: Duration::from_millis(200),
            segment_poll_interval: Duration::from_millis(10),
            throttle_interval: Duration::from_millis(50),
            cleaner_interval: Duration::from_millis(50),
            cleaner_delete_delay: Duration::ZERO,
            restart_gap_seconds: 24,
        };
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = SurgeConfig::default();
        assert!(!config.encoding.enable_throttling);
        assert!(!config.encoding.enable_segment_deletion);
        assert_eq!(config.hls.default_segment_length, 6);
        assert_eq!(config.supervisor.segment_poll_interval, Duration::from_millis(100));
        assert_eq!(config.supervisor.restart_gap_seconds, 24);
    }

    #[test]
    fn test_floors_are_applied() {
        let mut options = EncodingOptions {
            throttle_delay_seconds: 10,
            segment_keep_seconds: 5,
            ..Default::default()
        };
        assert_eq!(options.effective_throttle_delay(), Duration::from_secs(60));
        assert_eq!(options.effective_segment_keep_seconds(), 20);

        options.segment_keep_seconds = 300;
        assert_eq!(options.effective_segment_keep_seconds(), 300);
    }

    #[test]
    fn test_env_overrides() {
        unsafe {
            std::env::set_var("SURGE_SEGMENT_KEEP_SECONDS", "90");
            std::env::set_var("SURGE_ENABLE_THROTTLING", "true");
            std::env::set_var("SURGE_SEGMENT_LENGTH", "not-a-number");
        }

        let config = SurgeConfig::from_env();
        assert_eq!(config.encoding.segment_keep_seconds, 90);
        assert!(config.encoding.enable_throttling);
        assert_eq!(config.hls.default_segment_length, 6);

        unsafe {
            std::env::remove_var("SURGE_SEGMENT_KEEP_SECONDS");
            std::env::remove_var("SURGE_ENABLE_THROTTLING");
            std::env::remove_var("SURGE_SEGMENT_LENGTH");
        }
    }
}
