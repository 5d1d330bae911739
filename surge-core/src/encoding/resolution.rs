//! Output dimension arithmetic and scale filter expressions.

/// Largest dimension produced by hardware scalers.
pub const MAX_HARDWARE_DIMENSION: u32 = 4096;

/// Resolves the exact output size used by hardware scale filters.
///
/// Fixed request dimensions win over the source, max dimensions shrink the
/// result proportionally, hardware output is capped at 4096 per side, and both
/// sides are rounded down to even numbers. Returns `None` when neither the
/// source nor the request supplies a dimension.
pub fn fixed_output_size(
    video_width: Option<u32>,
    video_height: Option<u32>,
    requested_width: Option<u32>,
    requested_height: Option<u32>,
    requested_max_width: Option<u32>,
    requested_max_height: Option<u32>,
) -> Option<(u32, u32)> {
    let input_width = video_width.or(requested_width)?;
    let input_height = video_height.or(requested_height)?;

    let mut output_width = requested_width.unwrap_or(input_width);
    let mut output_height = requested_height.unwrap_or(input_height);

    let maximum_width = requested_max_width
        .unwrap_or(output_width)
        .min(MAX_HARDWARE_DIMENSION);
    let maximum_height = requested_max_height
        .unwrap_or(output_height)
        .min(MAX_HARDWARE_DIMENSION);

    if output_width > maximum_width || output_height > maximum_height {
        let scale_w = maximum_width as f64 / output_width as f64;
        let scale_h = maximum_height as f64 / output_height as f64;
        let scale = scale_w.min(scale_h);
        output_width = maximum_width.min((output_width as f64 * scale).round() as u32);
        output_height = maximum_height.min((output_height as f64 * scale).round() as u32);
    }

    Some((2 * (output_width / 2), 2 * (output_height / 2)))
}

/// Aspect-preserving resize used to report output dimensions.
///
/// Unlike [`fixed_output_size`] there is no hardware cap and no rounding.
pub fn resize_within(
    source: (u32, u32),
    width: Option<u32>,
    height: Option<u32>,
    max_width: Option<u32>,
    max_height: Option<u32>,
) -> (u32, u32) {
    let (mut new_width, mut new_height) = source;
    if new_width == 0 || new_height == 0 {
        return (width.unwrap_or(new_width), height.unwrap_or(new_height));
    }

    let scaled_width = |current_w: u32, current_h: u32, target_h: u32| {
        (target_h as f64 / current_h as f64 * current_w as f64).round() as u32
    };
    let scaled_height = |current_w: u32, current_h: u32, target_w: u32| {
        (current_h as f64 / current_w as f64 * target_w as f64).round() as u32
    };

    match (width, height) {
        (Some(w), Some(h)) => {
            new_width = w;
            new_height = h;
        }
        (None, Some(h)) => {
            new_width = scaled_width(new_width, new_height, h);
            new_height = h;
        }
        (Some(w), None) => {
            new_height = scaled_height(new_width, new_height, w);
            new_width = w;
        }
        (None, None) => {}
    }

    if let Some(max_h) = max_height.filter(|max| *max < new_height) {
        new_width = scaled_width(new_width, new_height, max_h);
        new_height = max_h;
    }
    if let Some(max_w) = max_width.filter(|max| *max < new_width) {
        new_height = scaled_height(new_width, new_height, max_w);
        new_width = max_w;
    }

    (new_width, new_height)
}

/// Widest output an H.264-equivalent bitrate can carry without visible blocking.
const BITRATE_WIDTH_LADDER: &[(u32, u32)] = &[
    (365_000, 416),
    (730_000, 640),
    (1_100_000, 768),
    (3_000_000, 960),
    (6_000_000, 1280),
    (13_500_000, 1920),
    (20_000_000, 2560),
    (35_000_000, 3840),
];

/// Lowers resolution ceilings to what the output bitrate supports.
///
/// When the bitrate is not being reduced the existing ceilings are kept.
/// The reference bitrate is normalised to 30 fps before the ladder lookup.
/// A tightened width drops the height ceiling so aspect ratio decides it.
pub fn normalize_resolution(
    input_bitrate: Option<u32>,
    output_bitrate: u32,
    h264_equivalent_bitrate: u32,
    max_width: Option<u32>,
    max_height: Option<u32>,
    target_fps: Option<f32>,
) -> (Option<u32>, Option<u32>) {
    if input_bitrate.is_some_and(|input| output_bitrate >= input)
        && (max_width.is_some() || max_height.is_some())
    {
        return (max_width, max_height);
    }

    let fps = target_fps.filter(|fps| *fps > 0.0).unwrap_or(30.0);
    let reference = h264_equivalent_bitrate as f64 * (30.0 / fps as f64);

    let Some(&(_, ladder_width)) = BITRATE_WIDTH_LADDER
        .iter()
        .find(|(max_bitrate, _)| reference <= *max_bitrate as f64)
    else {
        return (max_width, max_height);
    };

    let width = max_width.map_or(ladder_width, |w| w.min(ladder_width));
    if max_width != Some(width) {
        return (Some(width), None);
    }
    (Some(width), max_height)
}

/// Software `scale=` expression for the request, or `None` when no scaling is asked for.
///
/// Expressions are evaluated by ffmpeg against the input so that aspect ratio
/// is honoured even when the probe missed the sample aspect ratio.
pub fn sw_scale_filter(
    video_encoder: &str,
    requested_width: Option<u32>,
    requested_height: Option<u32>,
    requested_max_width: Option<u32>,
    requested_max_height: Option<u32>,
) -> Option<String> {
    // V4L2 encoders need 64-aligned widths; MJPEG needs the sample aspect folded in
    let scale_val = if video_encoder.ends_with("_v4l2m2m") { 64 } else { 2 };
    let target_ar = if video_encoder == "mjpeg" { "(a*sar)" } else { "a" };

    match (requested_width, requested_height, requested_max_width, requested_max_height) {
        (Some(w), Some(h), _, _) => Some(format!(
            "scale=trunc({w}/{scale_val})*{scale_val}:trunc({h}/2)*2"
        )),
        (None, None, Some(max_w), Some(max_h)) => Some(format!(
            "scale=trunc(min(max(iw\\,ih*{target_ar})\\,min({max_w}\\,{max_h}*{target_ar}))/{scale_val})*{scale_val}:trunc(min(max(iw/{target_ar}\\,ih)\\,min({max_w}/{target_ar}\\,{max_h}))/2)*2"
        )),
        (Some(w), None, _, _) => Some(format!("scale={w}:trunc(ow/{target_ar}/2)*2")),
        (None, Some(h), _, _) => Some(format!(
            "scale=trunc(oh*{target_ar}/{scale_val})*{scale_val}:{h}"
        )),
        (None, None, Some(max_w), None) => Some(format!(
            "scale=trunc(min(max(iw\\,ih*{target_ar})\\,{max_w})/{scale_val})*{scale_val}:trunc(ow/{target_ar}/2)*2"
        )),
        (None, None, None, Some(max_h)) => Some(format!(
            "scale=trunc(oh*{target_ar}/{scale_val})*{scale_val}:min(max(iw/{target_ar}\\,ih)\\,{max_h})"
        )),
        (None, None, None, None) => None,
    }
}

/// `scale_<suffix>` filter for a hardware scaler.
///
/// Emitted only when the size or pixel format actually changes.
pub fn hw_scale_filter(
    suffix: &str,
    output_format: Option<&str>,
    video_width: Option<u32>,
    video_height: Option<u32>,
    requested_width: Option<u32>,
    requested_height: Option<u32>,
    requested_max_width: Option<u32>,
    requested_max_height: Option<u32>,
) -> Option<String> {
    let (out_width, out_height) = fixed_output_size(
        video_width,
        video_height,
        requested_width,
        requested_height,
        requested_max_width,
        requested_max_height,
    )?;

    let is_size_fixed = video_width != Some(out_width) || video_height != Some(out_height);
    let format = output_format.filter(|f| !f.is_empty());

    let mut filter = format!("scale_{suffix}");
    match (is_size_fixed, format) {
        (false, None) => return None,
        (true, None) => filter.push_str(&format!("=w={out_width}:h={out_height}")),
        (false, Some(format)) => filter.push_str(&format!("=format={format}")),
        (true, Some(format)) => {
            filter.push_str(&format!("=w={out_width}:h={out_height}:format={format}"))
        }
    }
    Some(filter)
}
