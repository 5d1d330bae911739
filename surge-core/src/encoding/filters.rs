//! Video filter graph construction.
//!
//! Every backend produces the same [`FilterChain`]: main video filters,
//! filters applied to a graphical subtitle input, and the overlay step that
//! merges the two. When the whole graph can run on the device the decoded
//! frames never leave it ("zero copy"); otherwise frames are copied back,
//! filtered in software and uploaded again for a hardware encoder.

use crate::config::EncodingOptions;
use crate::encoding::hwaccel::{HardwareAccelerationType, HardwareCapabilities, backend_of_encoder};
use crate::encoding::job_info::EncodingJobInfo;
use crate::encoding::resolution::{fixed_output_size, hw_scale_filter, sw_scale_filter};
use crate::media::{MediaStream, VideoRange};

/// Ordered filter lists for one encode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterChain {
    pub main: Vec<String>,
    pub subtitle: Vec<String>,
    pub overlay: Vec<String>,
    /// Decoded frames stay in device memory for the whole graph
    pub zero_copy: bool,
}

impl FilterChain {
    pub fn is_empty(&self) -> bool {
        self.main.is_empty() && self.subtitle.is_empty() && self.overlay.is_empty()
    }

    /// `-vf` for a single chain, `-filter_complex` when a subtitle input is overlaid.
    ///
    /// `video_input` and `subtitle_input` are ffmpeg stream specifiers such as
    /// `0:0` and `1:0`.
    pub fn to_filter_args(&self, video_input: &str, subtitle_input: &str) -> Vec<String> {
        if self.overlay.is_empty() {
            if self.main.is_empty() {
                return Vec::new();
            }
            return vec!["-vf".to_string(), self.main.join(",")];
        }

        let main = if self.main.is_empty() {
            "null".to_string()
        } else {
            self.main.join(",")
        };
        let subtitle = if self.subtitle.is_empty() {
            "null".to_string()
        } else {
            self.subtitle.join(",")
        };
        vec![
            "-filter_complex".to_string(),
            format!(
                "[{video_input}]{main}[main];[{subtitle_input}]{subtitle}[sub];[main][sub]{}",
                self.overlay.join(",")
            ),
        ]
    }
}

/// Device-side filter names of a backend.
struct DeviceFilters {
    scale_suffix: &'static str,
    /// Pixel format hardware encoders of this backend accept
    encode_format: &'static str,
    deinterlace: Option<&'static str>,
    tonemap: Option<&'static str>,
    overlay: Option<&'static str>,
    upload: &'static str,
}

fn device_filters(backend: HardwareAccelerationType) -> Option<DeviceFilters> {
    let filters = match backend {
        HardwareAccelerationType::None => return None,
        HardwareAccelerationType::Vaapi => DeviceFilters {
            scale_suffix: "vaapi",
            encode_format: "nv12",
            deinterlace: Some("deinterlace_vaapi"),
            tonemap: Some("tonemap_vaapi"),
            overlay: Some("overlay_vaapi"),
            upload: "hwupload=derive_device=vaapi",
        },
        HardwareAccelerationType::Qsv => DeviceFilters {
            scale_suffix: "qsv",
            encode_format: "nv12",
            deinterlace: Some("vpp_qsv"),
            tonemap: Some("vpp_qsv"),
            overlay: Some("overlay_qsv"),
            upload: "hwupload=derive_device=qsv:extra_hw_frames=64",
        },
        HardwareAccelerationType::Nvenc => DeviceFilters {
            scale_suffix: "cuda",
            encode_format: "yuv420p",
            deinterlace: Some("yadif_cuda"),
            tonemap: Some("tonemap_cuda"),
            overlay: Some("overlay_cuda"),
            upload: "hwupload_cuda",
        },
        HardwareAccelerationType::Amf => DeviceFilters {
            scale_suffix: "opencl",
            encode_format: "nv12",
            deinterlace: None,
            tonemap: Some("tonemap_opencl"),
            overlay: Some("overlay_opencl"),
            upload: "hwupload=derive_device=opencl",
        },
        HardwareAccelerationType::VideoToolbox => DeviceFilters {
            scale_suffix: "vt",
            encode_format: "nv12",
            deinterlace: Some("yadif_videotoolbox"),
            tonemap: Some("tonemap_videotoolbox"),
            overlay: Some("overlay_videotoolbox"),
            upload: "hwupload=derive_device=videotoolbox",
        },
        HardwareAccelerationType::Rkmpp => DeviceFilters {
            scale_suffix: "rkrga",
            encode_format: "nv12",
            deinterlace: None,
            tonemap: None,
            overlay: Some("overlay_rkrga"),
            upload: "hwupload=derive_device=rkmpp",
        },
    };
    Some(filters)
}

/// What the graph has to do, independent of backend.
struct FilterNeeds {
    deinterlace: bool,
    tonemap: bool,
    graphical_subtitles: bool,
    text_subtitles: bool,
}

fn filter_needs(job: &EncodingJobInfo, options: &EncodingOptions, stream: &MediaStream) -> FilterNeeds {
    let codec = stream.codec.as_deref().unwrap_or_default();
    let requested_ranges = job
        .actual_output_video_codec()
        .map(|codec| job.base_request.requested_range_types(&codec))
        .unwrap_or_default();
    let client_accepts_source_range = requested_ranges
        .iter()
        .any(|range| range.eq_ignore_ascii_case(stream.video_range_type.as_str()));

    FilterNeeds {
        deinterlace: job.deinterlace(codec, true),
        tonemap: options.enable_tonemapping
            && stream.video_range() == VideoRange::Hdr
            && !client_accepts_source_range,
        graphical_subtitles: job.has_graphical_subtitle_burn_in(),
        text_subtitles: job.has_text_subtitle_burn_in(),
    }
}

/// Frame rate filter value when the output must be slowed down.
pub fn framerate_param(job: &EncodingJobInfo) -> Option<f32> {
    let request = &job.base_request;
    if let Some(framerate) = request.framerate {
        return Some(framerate);
    }
    let max = request.max_framerate?;
    let content = job
        .video_stream
        .as_ref()
        .and_then(|s| s.average_frame_rate.or(s.real_frame_rate))?;
    (content > max).then_some(max)
}

/// Escapes a path for use inside a filter argument, which ffmpeg unescapes twice.
pub fn escape_filter_path(path: &str) -> String {
    path.replace('\\', "/")
        .replace(':', "\\:")
        .replace('\'', "'\\\\\\''")
        .replace('"', "\\\"")
}

/// `subtitles=` filter rendering a text subtitle stream onto the video.
fn text_subtitles_filter(job: &EncodingJobInfo, stream: &MediaStream) -> String {
    if stream.is_external {
        let path = stream.path.as_deref().unwrap_or_default();
        return format!("subtitles=f='{}'", escape_filter_path(path));
    }
    // `si` counts subtitle streams only
    let subtitle_index = job
        .media_source
        .as_ref()
        .map(|source| {
            source
                .streams_of(crate::media::MediaStreamType::Subtitle)
                .into_iter()
                .filter(|s| !s.is_external)
                .position(|s| s == stream)
                .unwrap_or(0)
        })
        .unwrap_or(0);
    format!(
        "subtitles=f='{}':si={}",
        escape_filter_path(&job.media_path),
        subtitle_index
    )
}

fn sw_deinterlace_filter(options: &EncodingOptions) -> String {
    let method = if options.deinterlace_method.eq_ignore_ascii_case("bwdif") {
        "bwdif"
    } else {
        "yadif"
    };
    let rate = if options.deinterlace_double_rate { 1 } else { 0 };
    format!("{method}={rate}:-1:0")
}

fn hw_deinterlace_filter(
    backend: HardwareAccelerationType,
    name: &str,
    options: &EncodingOptions,
) -> String {
    let double_rate = options.deinterlace_double_rate;
    match backend {
        HardwareAccelerationType::Vaapi if double_rate => format!("{name}=rate=field"),
        HardwareAccelerationType::Vaapi => name.to_string(),
        HardwareAccelerationType::Qsv => {
            format!("{name}=deinterlace=2{}", if double_rate { ":rate=field" } else { "" })
        }
        HardwareAccelerationType::Nvenc
            if options.deinterlace_method.eq_ignore_ascii_case("bwdif") =>
        {
            format!("bwdif_cuda={}:-1:0", u8::from(double_rate))
        }
        _ => format!("{name}={}:-1:0", u8::from(double_rate)),
    }
}

fn hw_tonemap_filter(
    backend: HardwareAccelerationType,
    name: &str,
    format: &str,
    options: &EncodingOptions,
) -> String {
    match backend {
        HardwareAccelerationType::Qsv => format!("{name}=tonemap=1:format={format}"),
        HardwareAccelerationType::Vaapi | HardwareAccelerationType::VideoToolbox => {
            format!("{name}=format={format}:t=bt709:m=bt709:p=bt709")
        }
        _ => format!(
            "{name}=tonemap={}:desat={}:peak={}:format={format}:t=bt709:m=bt709:p=bt709",
            options.tonemapping_algorithm, options.tonemapping_desat, options.tonemapping_peak
        ),
    }
}

/// Whether the full graph can run on the device for this job.
pub fn can_use_zero_copy(
    job: &EncodingJobInfo,
    options: &EncodingOptions,
    capabilities: &HardwareCapabilities,
) -> bool {
    let Some(stream) = job.video_stream.as_ref() else {
        return false;
    };
    let Some(encoder) = job.video_encoder.as_deref() else {
        return false;
    };
    let backend = job.hw_backend;
    if !job.hardware_decoding || backend_of_encoder(encoder) != backend {
        return false;
    }
    let Some(filters) = device_filters(backend) else {
        return false;
    };

    let needs = filter_needs(job, options, stream);
    let has = |name: Option<&str>| name.is_some_and(|n| capabilities.has_filter(n));
    let scale_name = format!("scale_{}", filters.scale_suffix);

    // Text rendering only exists in software
    !needs.text_subtitles
        && capabilities.has_filter(&scale_name)
        && (!needs.deinterlace || has(filters.deinterlace))
        && (!needs.tonemap || has(filters.tonemap))
        && (!needs.graphical_subtitles || has(filters.overlay))
}

/// Builds the filter graph for the negotiated job.
///
/// Stream copies and jobs without video get an empty chain.
pub fn build_filter_chain(
    job: &EncodingJobInfo,
    options: &EncodingOptions,
    capabilities: &HardwareCapabilities,
) -> FilterChain {
    let (Some(stream), Some(encoder)) = (job.video_stream.as_ref(), job.video_encoder.as_deref())
    else {
        return FilterChain::default();
    };
    if job.is_video_copy() {
        return FilterChain::default();
    }

    let mut chain = if can_use_zero_copy(job, options, capabilities) {
        device_chain(job, options, stream)
    } else {
        software_chain(job, options, capabilities, stream, encoder)
    };

    if let Some(framerate) = framerate_param(job) {
        chain.main.insert(0, format!("fps={framerate}"));
    }
    chain
}

/// Whole graph on the device.
fn device_chain(job: &EncodingJobInfo, options: &EncodingOptions, stream: &MediaStream) -> FilterChain {
    let backend = job.hw_backend;
    let mut chain = FilterChain {
        zero_copy: true,
        ..Default::default()
    };
    let Some(filters) = device_filters(backend) else {
        return chain;
    };
    let needs = filter_needs(job, options, stream);
    let request = &job.base_request;

    if needs.deinterlace {
        if let Some(name) = filters.deinterlace {
            chain.main.push(hw_deinterlace_filter(backend, name, options));
        }
    }

    // Tone mapping sets the output format itself
    let scale_format = (!needs.tonemap).then_some(filters.encode_format);
    if let Some(scale) = hw_scale_filter(
        filters.scale_suffix,
        scale_format,
        stream.width,
        stream.height,
        request.width,
        request.height,
        request.max_width,
        request.max_height,
    ) {
        chain.main.push(scale);
    }

    if needs.tonemap {
        if let Some(name) = filters.tonemap {
            chain
                .main
                .push(hw_tonemap_filter(backend, name, filters.encode_format, options));
        }
    }

    if needs.graphical_subtitles {
        if let Some((width, height)) = fixed_output_size(
            stream.width,
            stream.height,
            request.width,
            request.height,
            request.max_width,
            request.max_height,
        ) {
            chain.subtitle.push(format!("scale={width}:{height}:fast_bilinear"));
        }
        chain.subtitle.push("format=bgra".to_string());
        chain.subtitle.push(filters.upload.to_string());
        if let Some(overlay) = filters.overlay {
            chain.overlay.push(format!("{overlay}=eof_action=pass:repeatlast=0"));
        }
    }

    chain
}

/// Software filtering, re-uploading to the device when a hardware encoder is used.
fn software_chain(
    job: &EncodingJobInfo,
    options: &EncodingOptions,
    capabilities: &HardwareCapabilities,
    stream: &MediaStream,
    encoder: &str,
) -> FilterChain {
    let mut chain = FilterChain::default();
    let needs = filter_needs(job, options, stream);
    let request = &job.base_request;

    let encoder_backend = backend_of_encoder(encoder);
    let upload_filters = device_filters(encoder_backend);
    let out_format = upload_filters
        .as_ref()
        .map_or("yuv420p", |filters| filters.encode_format);

    if needs.deinterlace {
        chain.main.push(sw_deinterlace_filter(options));
    }

    let scale = sw_scale_filter(
        encoder,
        request.width,
        request.height,
        request.max_width,
        request.max_height,
    );
    if let Some(scale) = &scale {
        chain.main.push(scale.clone());
    }

    if needs.tonemap && capabilities.has_filter("tonemapx") {
        chain.main.push(format!(
            "tonemapx=tonemap={}:desat={}:peak={}:t=bt709:m=bt709:p=bt709:format={out_format}",
            options.tonemapping_algorithm, options.tonemapping_desat, options.tonemapping_peak
        ));
    } else {
        chain.main.push(format!("format={out_format}"));
    }

    if needs.text_subtitles {
        if let Some(subtitle) = job.subtitle_stream.as_ref() {
            chain.main.push(text_subtitles_filter(job, subtitle));
        }
    } else if needs.graphical_subtitles {
        if let Some(scale) = scale {
            chain.subtitle.push(scale);
        }
        chain
            .overlay
            .push("overlay=eof_action=pass:repeatlast=0".to_string());
    }

    if let Some(filters) = upload_filters {
        // Upload must follow the overlay when one exists
        if chain.overlay.is_empty() {
            chain.main.push(filters.upload.to_string());
        } else {
            chain.overlay.push(format!("format={}", filters.encode_format));
            chain.overlay.push(filters.upload.to_string());
        }
    }

    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::job_info::TranscodingJobType;
    use crate::encoding::options::{BaseEncodingJobOptions, SubtitleDeliveryMethod};
    use crate::media::{MediaSourceInfo, MediaStreamType, VideoRangeType};

    fn caps(filters: &[&str]) -> HardwareCapabilities {
        HardwareCapabilities {
            filters: filters.iter().map(|f| f.to_string()).collect(),
            ..Default::default()
        }
    }

    fn job(encoder: &str, backend: HardwareAccelerationType, hw_decode: bool) -> EncodingJobInfo {
        let mut job = EncodingJobInfo::new(
            BaseEncodingJobOptions {
                max_width: Some(1280),
                ..Default::default()
            },
            TranscodingJobType::Hls,
        );
        job.media_path = "/media/movie.mkv".to_string();
        job.video_stream = Some(MediaStream {
            index: 0,
            codec: Some("h264".to_string()),
            width: Some(1920),
            height: Some(1080),
            video_range_type: VideoRangeType::Sdr,
            ..Default::default()
        });
        job.output_video_codec = Some("h264".to_string());
        job.video_encoder = Some(encoder.to_string());
        job.hw_backend = backend;
        job.hardware_decoding = hw_decode;
        job
    }

    #[test]
    fn test_software_chain() {
        let chain = build_filter_chain(
            &job("libx264", HardwareAccelerationType::None, false),
            &EncodingOptions::default(),
            &HardwareCapabilities::default(),
        );
        assert!(!chain.zero_copy);
        assert_eq!(
            chain.main,
            vec![
                "scale=trunc(min(max(iw\\,ih*a)\\,1280)/2)*2:trunc(ow/a/2)*2".to_string(),
                "format=yuv420p".to_string(),
            ]
        );
        assert_eq!(
            chain.to_filter_args("0:0", "0:2")[0],
            "-vf".to_string()
        );
    }

    #[test]
    fn test_vaapi_zero_copy_chain() {
        let chain = build_filter_chain(
            &job("h264_vaapi", HardwareAccelerationType::Vaapi, true),
            &EncodingOptions::default(),
            &caps(&["scale_vaapi", "deinterlace_vaapi"]),
        );
        assert!(chain.zero_copy);
        assert_eq!(chain.main, vec!["scale_vaapi=w=1280:h=720:format=nv12".to_string()]);
    }

    #[test]
    fn test_legacy_chain_uploads_for_hw_encoder() {
        // Missing scale_cuda forces the copy-back path
        let chain = build_filter_chain(
            &job("h264_nvenc", HardwareAccelerationType::Nvenc, true),
            &EncodingOptions::default(),
            &caps(&[]),
        );
        assert!(!chain.zero_copy);
        assert_eq!(chain.main.last().map(String::as_str), Some("hwupload_cuda"));
        assert!(chain.main.contains(&"format=yuv420p".to_string()));
    }

    #[test]
    fn test_graphical_subtitle_overlay_uses_filter_complex() {
        let mut job = job("libx264", HardwareAccelerationType::None, false);
        let subtitle = MediaStream {
            index: 2,
            stream_type: MediaStreamType::Subtitle,
            codec: Some("hdmv_pgs_subtitle".to_string()),
            ..Default::default()
        };
        job.subtitle_stream = Some(subtitle);
        job.subtitle_delivery_method = SubtitleDeliveryMethod::Encode;

        let chain = build_filter_chain(&job, &EncodingOptions::default(), &HardwareCapabilities::default());
        assert_eq!(chain.overlay, vec!["overlay=eof_action=pass:repeatlast=0".to_string()]);
        let args = chain.to_filter_args("0:0", "0:2");
        assert_eq!(args[0], "-filter_complex");
        assert!(args[1].starts_with("[0:0]scale="));
        assert!(args[1].contains("[main];[0:2]scale="));
        assert!(args[1].ends_with("[sub];[main][sub]overlay=eof_action=pass:repeatlast=0"));
    }

    #[test]
    fn test_text_subtitles_are_burned_in_main_chain() {
        let mut job = job("libx264", HardwareAccelerationType::None, false);
        let subtitle = MediaStream {
            index: 3,
            stream_type: MediaStreamType::Subtitle,
            codec: Some("subrip".to_string()),
            ..Default::default()
        };
        job.media_source = Some(MediaSourceInfo {
            media_streams: vec![job.video_stream.clone().unwrap(), subtitle.clone()],
            ..Default::default()
        });
        job.subtitle_stream = Some(subtitle);
        job.subtitle_delivery_method = SubtitleDeliveryMethod::Encode;

        let chain = build_filter_chain(&job, &EncodingOptions::default(), &HardwareCapabilities::default());
        assert_eq!(
            chain.main.last().map(String::as_str),
            Some("subtitles=f='/media/movie.mkv':si=0")
        );
        assert!(chain.overlay.is_empty());
    }

    #[test]
    fn test_fps_and_deinterlace_filters() {
        let mut job = job("libx264", HardwareAccelerationType::None, false);
        job.base_request.max_width = None;
        job.base_request.framerate = Some(25.0);
        if let Some(stream) = job.video_stream.as_mut() {
            stream.is_interlaced = true;
        }
        let chain = build_filter_chain(&job, &EncodingOptions::default(), &HardwareCapabilities::default());
        assert_eq!(chain.main[0], "fps=25");
        assert_eq!(chain.main[1], "yadif=0:-1:0");
    }

    #[test]
    fn test_escape_filter_path() {
        assert_eq!(escape_filter_path("C:\\media\\a.mkv"), "C\\:/media/a.mkv");
    }

    #[test]
    fn test_copy_has_no_filters() {
        let mut job = job("libx264", HardwareAccelerationType::None, false);
        job.output_video_codec = Some("copy".to_string());
        assert!(build_filter_chain(&job, &EncodingOptions::default(), &HardwareCapabilities::default()).is_empty());
    }
}
