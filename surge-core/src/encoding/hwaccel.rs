//! Hardware acceleration backends.
//!
//! Backends form a closed set. Everything backend-specific (device init,
//! decoder flags, encoder names, filter names) is a `match` over
//! [`HardwareAccelerationType`]; the backend itself is chosen once per job by
//! [`select_backend`], a pure function of platform, configuration and probed
//! capabilities.

use std::collections::BTreeSet;
use std::path::Path;

use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::EncodingOptions;
use crate::media::MediaStream;

/// Hardware acceleration backend requested by the server configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum HardwareAccelerationType {
    /// Software decode, filter and encode
    #[default]
    None,
    Vaapi,
    /// Intel Quick Sync
    Qsv,
    /// NVIDIA NVENC/NVDEC via CUDA
    Nvenc,
    /// AMD AMF
    Amf,
    VideoToolbox,
    /// Rockchip MPP with RGA filtering
    Rkmpp,
}

impl HardwareAccelerationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Vaapi => "vaapi",
            Self::Qsv => "qsv",
            Self::Nvenc => "nvenc",
            Self::Amf => "amf",
            Self::VideoToolbox => "videotoolbox",
            Self::Rkmpp => "rkmpp",
        }
    }

    /// Whether the backend exists on `platform` at all.
    pub fn is_supported_on(&self, platform: Platform) -> bool {
        match self {
            Self::None => true,
            Self::Vaapi | Self::Rkmpp => platform == Platform::Linux,
            Self::Qsv | Self::Nvenc => matches!(platform, Platform::Linux | Platform::Windows),
            Self::Amf => platform == Platform::Windows,
            Self::VideoToolbox => platform == Platform::MacOs,
        }
    }

    /// Suffix of the backend's encoder names, e.g. `h264_<suffix>`.
    pub fn encoder_suffix(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Vaapi => Some("vaapi"),
            Self::Qsv => Some("qsv"),
            Self::Nvenc => Some("nvenc"),
            Self::Amf => Some("amf"),
            Self::VideoToolbox => Some("videotoolbox"),
            Self::Rkmpp => Some("rkmpp"),
        }
    }

    /// Name ffmpeg lists under `-hwaccels` for this backend.
    pub fn hwaccel_name(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Vaapi => Some("vaapi"),
            Self::Qsv => Some("qsv"),
            Self::Nvenc => Some("cuda"),
            Self::Amf => Some("d3d11va"),
            Self::VideoToolbox => Some("videotoolbox"),
            Self::Rkmpp => Some("rkmpp"),
        }
    }

    /// Pixel format of decoded frames left in device memory.
    pub fn device_frame_format(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Vaapi => Some("vaapi"),
            Self::Qsv => Some("qsv"),
            Self::Nvenc => Some("cuda"),
            Self::Amf => Some("d3d11"),
            Self::VideoToolbox => Some("videotoolbox_vld"),
            Self::Rkmpp => Some("drm_prime"),
        }
    }

    /// Source codecs the backend can decode.
    fn decodable_codecs(&self) -> &'static [&'static str] {
        match self {
            Self::None => &[],
            Self::Vaapi | Self::Qsv | Self::Nvenc => &[
                "h264",
                "hevc",
                "vp8",
                "vp9",
                "av1",
                "mpeg2video",
                "vc1",
            ],
            Self::Amf => &["h264", "hevc", "vp9", "av1", "mpeg2video", "vc1"],
            Self::VideoToolbox => &["h264", "hevc", "vp9", "av1", "mpeg2video"],
            Self::Rkmpp => &["h264", "hevc", "vp8", "vp9", "av1", "mpeg2video"],
        }
    }
}

impl std::str::FromStr for HardwareAccelerationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" | "software" => Ok(Self::None),
            "vaapi" => Ok(Self::Vaapi),
            "qsv" => Ok(Self::Qsv),
            "nvenc" | "cuda" => Ok(Self::Nvenc),
            "amf" => Ok(Self::Amf),
            "videotoolbox" => Ok(Self::VideoToolbox),
            "rkmpp" => Ok(Self::Rkmpp),
            _ => Err(format!("Invalid hardware acceleration type: {s}")),
        }
    }
}

impl std::fmt::Display for HardwareAccelerationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operating system family, which constrains the usable backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Linux,
    Windows,
    MacOs,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Other
        }
    }
}

/// What the installed ffmpeg build supports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardwareCapabilities {
    pub hwaccels: BTreeSet<String>,
    pub encoders: BTreeSet<String>,
    pub decoders: BTreeSet<String>,
    pub filters: BTreeSet<String>,
    /// VAAPI device is driven by the AMD radeonsi driver
    pub is_vaapi_device_amd: bool,
}

impl HardwareCapabilities {
    pub fn has_encoder(&self, name: &str) -> bool {
        self.encoders.contains(name)
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.filters.contains(name)
    }

    pub fn has_hwaccel(&self, name: &str) -> bool {
        self.hwaccels.contains(name)
    }

    /// Queries `ffmpeg` for its hwaccels, codecs and filters.
    ///
    /// A failed query yields an empty set for that category, which makes
    /// every hardware path fall back to software.
    pub async fn probe(ffmpeg_path: &Path) -> Self {
        let hwaccels = run_listing(ffmpeg_path, "-hwaccels")
            .await
            .map(|out| parse_hwaccels(&out))
            .unwrap_or_default();
        let encoders = run_listing(ffmpeg_path, "-encoders")
            .await
            .map(|out| parse_codec_listing(&out))
            .unwrap_or_default();
        let decoders = run_listing(ffmpeg_path, "-decoders")
            .await
            .map(|out| parse_codec_listing(&out))
            .unwrap_or_default();
        let filters = run_listing(ffmpeg_path, "-filters")
            .await
            .map(|out| parse_filter_listing(&out))
            .unwrap_or_default();

        debug!(
            "Probed ffmpeg capabilities: {} hwaccels, {} encoders, {} decoders, {} filters",
            hwaccels.len(),
            encoders.len(),
            decoders.len(),
            filters.len()
        );

        Self {
            hwaccels,
            encoders,
            decoders,
            filters,
            is_vaapi_device_amd: false,
        }
    }
}

async fn run_listing(ffmpeg_path: &Path, flag: &str) -> Option<String> {
    match Command::new(ffmpeg_path)
        .arg("-hide_banner")
        .arg(flag)
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(output) => {
            warn!("ffmpeg {} exited with {}", flag, output.status);
            None
        }
        Err(e) => {
            warn!("Failed to run ffmpeg {}: {}", flag, e);
            None
        }
    }
}

/// Parses `ffmpeg -hwaccels` output.
pub fn parse_hwaccels(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.ends_with(':'))
        .map(String::from)
        .collect()
}

/// Parses `ffmpeg -encoders` / `-decoders` output (entries follow a `------` rule).
pub fn parse_codec_listing(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .skip_while(|line| line.trim() != "------")
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(String::from)
        .collect()
}

/// Parses `ffmpeg -filters` output, where entries look like ` T.C scale  V->V  ...`.
pub fn parse_filter_listing(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let _flags = parts.next()?;
            let name = parts.next()?;
            let io = parts.next()?;
            io.contains("->").then(|| name.to_string())
        })
        .collect()
}

/// Chooses the backend for a job.
///
/// Falls back to [`HardwareAccelerationType::None`] when the configured
/// backend does not exist on `platform` or the ffmpeg build lacks it.
pub fn select_backend(
    platform: Platform,
    configured: HardwareAccelerationType,
    capabilities: &HardwareCapabilities,
) -> HardwareAccelerationType {
    if !configured.is_supported_on(platform) {
        return HardwareAccelerationType::None;
    }

    match (configured.hwaccel_name(), configured.encoder_suffix()) {
        (Some(hwaccel), Some(suffix)) => {
            let has_hwaccel = capabilities.has_hwaccel(hwaccel);
            let has_encoder = capabilities
                .encoders
                .iter()
                .any(|encoder| encoder.ends_with(&format!("_{suffix}")));
            if has_hwaccel || has_encoder {
                configured
            } else {
                HardwareAccelerationType::None
            }
        }
        _ => HardwareAccelerationType::None,
    }
}

/// Whether `backend` may decode `stream` on the device.
///
/// Checks the server's codec allow-list, the backend's codec support, chroma
/// subsampling and bit depth.
pub fn can_hardware_decode(
    backend: HardwareAccelerationType,
    stream: &MediaStream,
    options: &EncodingOptions,
) -> bool {
    let Some(codec) = stream.codec.as_deref().map(str::to_ascii_lowercase) else {
        return false;
    };
    let codec = if codec == "h265" { "hevc".to_string() } else { codec };

    if !backend.decodable_codecs().contains(&codec.as_str()) {
        return false;
    }
    if !options
        .hardware_decoding_codecs
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(&codec))
    {
        return false;
    }

    // 4:2:2 and 4:4:4 sources are outside every consumer decoder profile
    if stream
        .pixel_format
        .as_deref()
        .is_some_and(|fmt| fmt.contains("422") || fmt.contains("444"))
    {
        return false;
    }

    let bit_depth = stream.bit_depth.unwrap_or(8);
    match codec.as_str() {
        "hevc" if bit_depth == 10 => options.enable_decoding_color_depth_10_hevc,
        "vp9" if bit_depth == 10 => options.enable_decoding_color_depth_10_vp9,
        "av1" => bit_depth <= 10,
        _ => bit_depth == 8,
    }
}

/// `-init_hw_device` / `-filter_hw_device` arguments for the backend.
pub fn hw_device_init_args(
    backend: HardwareAccelerationType,
    options: &EncodingOptions,
    platform: Platform,
) -> Vec<String> {
    let args: Vec<String> = match backend {
        HardwareAccelerationType::None => Vec::new(),
        HardwareAccelerationType::Vaapi => vec![
            "-init_hw_device".into(),
            format!("vaapi=va:{}", options.vaapi_device),
            "-filter_hw_device".into(),
            "va".into(),
        ],
        HardwareAccelerationType::Qsv if platform == Platform::Windows => vec![
            "-init_hw_device".into(),
            "d3d11va=dx11:,vendor=0x8086".into(),
            "-init_hw_device".into(),
            "qsv=qs@dx11".into(),
            "-filter_hw_device".into(),
            "qs".into(),
        ],
        HardwareAccelerationType::Qsv => {
            let device = options
                .qsv_device
                .clone()
                .unwrap_or_else(|| options.vaapi_device.clone());
            vec![
                "-init_hw_device".into(),
                format!("vaapi=va:{device}"),
                "-init_hw_device".into(),
                "qsv=qs@va".into(),
                "-filter_hw_device".into(),
                "qs".into(),
            ]
        }
        HardwareAccelerationType::Nvenc => vec![
            "-init_hw_device".into(),
            "cuda=cu:0".into(),
            "-filter_hw_device".into(),
            "cu".into(),
        ],
        HardwareAccelerationType::Amf => vec![
            "-init_hw_device".into(),
            "d3d11va=dx11:,vendor=0x1002".into(),
            "-init_hw_device".into(),
            "opencl=ocl@dx11".into(),
            "-filter_hw_device".into(),
            "ocl".into(),
        ],
        HardwareAccelerationType::VideoToolbox => {
            vec!["-init_hw_device".into(), "videotoolbox=vt".into()]
        }
        HardwareAccelerationType::Rkmpp => vec![
            "-init_hw_device".into(),
            "rkmpp=rk".into(),
            "-filter_hw_device".into(),
            "rk".into(),
        ],
    };
    args
}

/// `-hwaccel` arguments enabling hardware decode.
///
/// With `keep_on_device` decoded frames stay in device memory for a
/// zero-copy filter chain; otherwise ffmpeg copies them back to system memory.
pub fn hw_decoder_args(backend: HardwareAccelerationType, keep_on_device: bool) -> Vec<String> {
    let Some(hwaccel) = backend.hwaccel_name() else {
        return Vec::new();
    };

    let mut args = vec!["-hwaccel".to_string(), hwaccel.to_string()];
    if keep_on_device {
        if let Some(format) = backend.device_frame_format() {
            args.push("-hwaccel_output_format".to_string());
            args.push(format.to_string());
        }
    }
    args.push("-noautorotate".to_string());
    args
}

/// Maps an output codec onto the encoder ffmpeg should run.
pub fn video_encoder_for(
    codec: &str,
    backend: HardwareAccelerationType,
    options: &EncodingOptions,
    capabilities: &HardwareCapabilities,
) -> String {
    let codec = codec.to_ascii_lowercase();
    let (family, software) = match codec.as_str() {
        "h264" | "avc" => ("h264", "libx264"),
        "hevc" | "h265" => ("hevc", "libx265"),
        "av1" => ("av1", "libsvtav1"),
        "vp8" => return "libvpx".to_string(),
        "vp9" => return "libvpx-vp9".to_string(),
        "theora" => return "libtheora".to_string(),
        "mpeg4" => return "mpeg4".to_string(),
        _ => return codec,
    };

    if options.enable_hardware_encoding {
        if let Some(suffix) = backend.encoder_suffix() {
            let hardware = format!("{family}_{suffix}");
            if capabilities.has_encoder(&hardware) {
                return hardware;
            }
        }
    }
    software.to_string()
}

/// Backend that owns `encoder`, if it is a hardware encoder.
pub fn backend_of_encoder(encoder: &str) -> HardwareAccelerationType {
    let backends = [
        HardwareAccelerationType::Vaapi,
        HardwareAccelerationType::Qsv,
        HardwareAccelerationType::Nvenc,
        HardwareAccelerationType::Amf,
        HardwareAccelerationType::VideoToolbox,
        HardwareAccelerationType::Rkmpp,
    ];
    backends
        .into_iter()
        .find(|backend| {
            backend
                .encoder_suffix()
                .is_some_and(|suffix| encoder.ends_with(&format!("_{suffix}")))
        })
        .unwrap_or(HardwareAccelerationType::None)
}
