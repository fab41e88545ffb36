// image_processing.rs - decode, illumination flattening and perspective rectification (Section 4.B)

use std::sync::OnceLock;

use base64::Engine;
use image::{GenericImageView, GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType};
use imageproc::contrast::otsu_level;
use imageproc::distance_transform::Norm;
use imageproc::morphology::erode;
use imageproc::template_matching::{find_extremes, match_template, MatchTemplateMethod};
use tracing::{debug, trace, warn};

use crate::alignment::{self, Quad};
use crate::config::AlignmentConfig;
use crate::error::{OmrError, OmrResult};

const MARKER_PNG_BYTES: &[u8] = include_bytes!("../assets/omr_marker.png");

fn marker_image() -> &'static GrayImage {
    static MARKER: OnceLock<GrayImage> = OnceLock::new();
    MARKER.get_or_init(|| {
        image::load_from_memory(MARKER_PNG_BYTES)
            .expect("shipped omr_marker.png is a valid image")
            .to_luma8()
    })
}

/// Which rectification strategy produced the image handed to the detector.
/// Not an error (Section 7): every variant but `Unrectified` is a normal,
/// expected outcome, and even `Unrectified` only degrades detection
/// quality, it does not abort the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RectificationOutcome {
    ContourMarkers,
    TemplateMatch,
    EdgeEnhancedMatch,
    ContourPageCrop,
    Unrectified,
}

impl RectificationOutcome {
    pub fn is_degraded(self) -> bool {
        !matches!(self, RectificationOutcome::ContourMarkers | RectificationOutcome::TemplateMatch)
    }
}

/// Decode raw encoded-image bytes, or a (possibly `data:`-prefixed)
/// base64-encoded string, to single-channel 8-bit grayscale.
pub fn decode_image_bytes(bytes: &[u8]) -> OmrResult<GrayImage> {
    let img = image::load_from_memory(bytes).map_err(|e| OmrError::invalid_image(e.to_string()))?;
    let gray = img.to_luma8();
    if gray.width() == 0 || gray.height() == 0 {
        return Err(OmrError::invalid_image("decoded image has zero dimensions"));
    }
    Ok(gray)
}

pub fn decode_image_base64(raw: &str) -> OmrResult<GrayImage> {
    let payload = match raw.find(',') {
        Some(idx) if raw[..idx].starts_with("data:") => &raw[idx + 1..],
        _ => raw,
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| OmrError::invalid_image(format!("invalid base64: {e}")))?;
    decode_image_bytes(&bytes)
}

// ---- intensity normalization -------------------------------------------

pub fn normalize_to_full_range(img: &GrayImage) -> GrayImage {
    let (min_val, max_val) = img
        .pixels()
        .fold((255u8, 0u8), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    let range = (max_val as f32 - min_val as f32).max(1.0);
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let v = img.get_pixel(x, y)[0] as f32;
        Luma([(((v - min_val as f32) / range) * 255.0).round().clamp(0.0, 255.0) as u8])
    })
}

/// A simplified CLAHE: clipped-histogram equalization on non-overlapping
/// tiles (Section 4.B shadow-flatten step).
fn apply_clahe(img: &GrayImage, clip_limit: f64, tile_size: u32) -> GrayImage {
    let (width, height) = img.dimensions();
    let mut out = img.clone();

    let mut ty = 0;
    while ty < height {
        let mut tx = 0;
        let end_y = (ty + tile_size).min(height);
        while tx < width {
            let end_x = (tx + tile_size).min(width);
            equalize_tile_clipped(&mut out, tx, ty, end_x, end_y, clip_limit);
            tx += tile_size;
        }
        ty += tile_size;
    }
    out
}

fn equalize_tile_clipped(img: &mut GrayImage, x0: u32, y0: u32, x1: u32, y1: u32, clip_limit: f64) {
    let mut histogram = [0u32; 256];
    let mut count = 0u32;
    for y in y0..y1 {
        for x in x0..x1 {
            histogram[img.get_pixel(x, y)[0] as usize] += 1;
            count += 1;
        }
    }
    if count == 0 {
        return;
    }

    let clip = ((clip_limit * count as f64) / 256.0).max(1.0) as u32;
    let mut excess = 0u32;
    for bucket in histogram.iter_mut() {
        if *bucket > clip {
            excess += *bucket - clip;
            *bucket = clip;
        }
    }
    let redistribute = excess / 256;
    for bucket in histogram.iter_mut() {
        *bucket += redistribute;
    }

    let mut cdf = [0u32; 256];
    cdf[0] = histogram[0];
    for i in 1..256 {
        cdf[i] = cdf[i - 1] + histogram[i];
    }

    for y in y0..y1 {
        for x in x0..x1 {
            let v = img.get_pixel(x, y)[0] as usize;
            let mapped = ((cdf[v] as f64 / count as f64) * 255.0).round().clamp(0.0, 255.0) as u8;
            img.put_pixel(x, y, Luma([mapped]));
        }
    }
}

/// `bg = GaussianBlur(img, sigma)`; `flat = (img/bg)*255`; CLAHE; normalize.
pub fn shadow_flatten(img: &GrayImage, blur_sigma: f32) -> GrayImage {
    let bg = imageproc::filter::gaussian_blur_f32(img, blur_sigma);
    let flat = GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let v = img.get_pixel(x, y)[0] as f32;
        let bgv = bg.get_pixel(x, y)[0] as f32;
        let ratio = if bgv > 1.0 { (v / bgv) * 255.0 } else { v };
        Luma([ratio.round().clamp(0.0, 255.0) as u8])
    });
    let equalized = apply_clahe(&flat, 2.0, 8);
    normalize_to_full_range(&equalized)
}

// ---- quadrant geometry ---------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Quadrant {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    outer_corner: (f64, f64),
}

impl Quadrant {
    fn diagonal(&self) -> f64 {
        ((self.w as f64).powi(2) + (self.h as f64).powi(2)).sqrt()
    }
}

/// Four quadrants per Section 4.B Pass 1 step 2: cut at `width/2` and
/// `height*2/3` so the top band (containing the TL/TR markers) is taller.
fn quadrants(width: u32, height: u32) -> [Quadrant; 4] {
    let cx = width / 2;
    let cy = height * 2 / 3;
    [
        Quadrant { x: 0, y: 0, w: cx, h: cy, outer_corner: (0.0, 0.0) },
        Quadrant { x: cx, y: 0, w: width - cx, h: cy, outer_corner: (width as f64, 0.0) },
        Quadrant { x: 0, y: cy, w: cx, h: height - cy, outer_corner: (0.0, height as f64) },
        Quadrant { x: cx, y: cy, w: width - cx, h: height - cy, outer_corner: (width as f64, height as f64) },
    ]
}

fn crop(img: &GrayImage, q: &Quadrant) -> GrayImage {
    image::imageops::crop_imm(img, q.x, q.y, q.w.max(1), q.h.max(1)).to_image()
}

// ---- Pass 1: contour-square marker detection -----------------------------

fn adaptive_threshold_gaussian_c_inv(img: &GrayImage, block_size: u32, c: f32) -> GrayImage {
    let sigma = (block_size as f32 / 6.0).max(0.8);
    let local_mean = imageproc::filter::gaussian_blur_f32(img, sigma);
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let v = img.get_pixel(x, y)[0] as f32;
        let t = local_mean.get_pixel(x, y)[0] as f32 - c;
        Luma([if v < t { 255 } else { 0 }])
    })
}

fn morphological_open_3x3(img: &GrayImage) -> GrayImage {
    let eroded = erode(img, Norm::LInf, 1);
    imageproc::morphology::dilate(&eroded, Norm::LInf, 1)
}

struct CandidateContour {
    center: (f64, f64),
    score: f64,
}

fn best_marker_contour_in_quadrant(
    full_img: &GrayImage,
    quadrant: &Quadrant,
    expected: f64,
    cfg: &AlignmentConfig,
) -> Option<CandidateContour> {
    let sub = crop(full_img, quadrant);
    let binary = adaptive_threshold_gaussian_c_inv(&sub, cfg.adaptive_block_size, cfg.adaptive_c);
    let opened = morphological_open_3x3(&binary);
    let contours = find_contours::<i32>(&opened);

    let min_area = (expected / 4.0).powi(2);
    let max_area = (expected * 2.5).powi(2);

    let mut best: Option<CandidateContour> = None;
    for contour in &contours {
        if contour.border_type != BorderType::Outer {
            continue;
        }
        let points: Vec<(f64, f64)> = contour
            .points
            .iter()
            .map(|p| (p.x as f64 + quadrant.x as f64, p.y as f64 + quadrant.y as f64))
            .collect();
        if points.len() < 3 {
            continue;
        }
        let metrics = match alignment::polygon_metrics(&points) {
            Some(m) => m,
            None => continue,
        };
        if !(min_area..=max_area).contains(&metrics.area) {
            continue;
        }
        let approx = alignment::approx_polygon(&points, 0.05);
        if !(4..=6).contains(&approx.len()) {
            continue;
        }
        let aspect = metrics.aspect_ratio();
        if !(0.65..=1.35).contains(&aspect) {
            continue;
        }
        let w = metrics.bbox.2 - metrics.bbox.0;
        let h = metrics.bbox.3 - metrics.bbox.1;
        if w < 5.0 || h < 5.0 {
            continue;
        }
        if metrics.solidity() < 0.7 {
            continue;
        }

        let center = metrics.center();
        let corner_dist = alignment::normalized_corner_distance(center, quadrant.outer_corner, quadrant.diagonal());
        let score = metrics.area - corner_dist * expected.powi(2);

        if best.as_ref().map(|b| score > b.score).unwrap_or(true) {
            best = Some(CandidateContour { center, score });
        }
    }
    best
}

fn pass1_contour_markers(img: &GrayImage, ratio: f64, cfg: &AlignmentConfig) -> Option<Quad> {
    let flattened = shadow_flatten(img, cfg.shadow_blur_sigma.max(30.0));
    let (width, height) = img.dimensions();
    let expected = (width as f64 / ratio).max(8.0);

    let mut centers = Vec::with_capacity(4);
    for quadrant in quadrants(width, height) {
        match best_marker_contour_in_quadrant(&flattened, &quadrant, expected, cfg) {
            Some(candidate) => centers.push(candidate.center),
            None => return None,
        }
    }
    Some(alignment::order_corners([centers[0], centers[1], centers[2], centers[3]]))
}

// ---- Pass 2 / Pass 3: template matching ----------------------------------

fn best_match(region: &GrayImage, marker: &GrayImage) -> Option<(f32, (u32, u32))> {
    if region.width() <= marker.width() || region.height() <= marker.height() {
        return None;
    }
    let result = match_template(region, marker, MatchTemplateMethod::CrossCorrelationNormalized);
    let extremes = find_extremes(&result);
    Some((extremes.max_value, extremes.max_value_location))
}

fn paint_quadrant_stripes(img: &mut GrayImage) {
    let (width, height) = img.dimensions();
    let cx = width / 2;
    let cy = height * 2 / 3;
    for y in 0..height {
        for dx in 0..2u32.min(width) {
            if cx >= 1 {
                img.put_pixel((cx - 1 + dx).min(width - 1), y, Luma([255]));
            }
        }
    }
    for x in 0..width {
        for dy in 0..2u32.min(height) {
            if cy >= 1 {
                img.put_pixel(x, (cy - 1 + dy).min(height - 1), Luma([255]));
            }
        }
    }
}

fn find_marker_centers(
    full_img: &GrayImage,
    marker_template: &GrayImage,
    ratio: f64,
    cfg: &AlignmentConfig,
) -> Option<[(f64, f64); 4]> {
    let (width, height) = full_img.dimensions();
    let marker_base_width = (width as f64 / ratio).max(4.0) as u32;

    let mut flattened = shadow_flatten(full_img, cfg.shadow_blur_sigma);
    paint_quadrant_stripes(&mut flattened);

    let mut best_global: Option<(f32, GrayImage)> = None;
    for step in 0..cfg.scale_steps {
        let scale = 1.0 - (step as f64 / (cfg.scale_steps - 1).max(1) as f64) * 0.65; // 100% down to 35%
        let target_width = ((marker_base_width as f64) * scale).round().max(4.0) as u32;
        let aspect = marker_template.height() as f64 / marker_template.width() as f64;
        let target_height = ((target_width as f64) * aspect).round().max(4.0) as u32;
        if target_width >= width || target_height >= height {
            continue;
        }
        let resized = image::imageops::resize(marker_template, target_width, target_height, image::imageops::FilterType::Gaussian);
        let resized = normalize_to_full_range(&resized);

        if let Some((score, _)) = best_match(&flattened, &resized) {
            if best_global.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
                best_global = Some((score, resized));
            }
        }
    }

    let (global_best_score, marker_at_scale) = best_global?;
    if global_best_score < cfg.min_matching_threshold {
        return None;
    }

    let (mw, mh) = marker_at_scale.dimensions();
    let mut centers = [(0.0, 0.0); 4];
    for (i, quadrant) in quadrants(width, height).into_iter().enumerate() {
        let sub = crop(&flattened, &quadrant);
        let (score, loc) = best_match(&sub, &marker_at_scale)?;
        if score < cfg.min_matching_threshold {
            return None;
        }
        if (global_best_score - score).abs() >= cfg.max_matching_variation {
            return None;
        }
        let center = (
            quadrant.x as f64 + loc.0 as f64 + mw as f64 / 2.0,
            quadrant.y as f64 + loc.1 as f64 + mh as f64 / 2.0,
        );
        let dx = (center.0 - quadrant.outer_corner.0).abs();
        let dy = (center.1 - quadrant.outer_corner.1).abs();
        if dx > width as f64 * 0.4 || dy > height as f64 * 0.4 {
            return None;
        }
        centers[i] = center;
    }
    Some(centers)
}

fn pass2_template_match(img: &GrayImage, ratio: f64, cfg: &AlignmentConfig) -> Option<Quad> {
    let marker = marker_image();
    let centers = find_marker_centers(img, marker, ratio, cfg)?;
    Some(alignment::order_corners(centers))
}

fn erode_subtract(img: &GrayImage, iterations: u32) -> GrayImage {
    let mut eroded = img.clone();
    for _ in 0..iterations {
        eroded = erode(&eroded, Norm::LInf, 2);
    }
    let edge = GrayImage::from_fn(img.width(), img.height(), |x, y| {
        let v = img.get_pixel(x, y)[0];
        let e = eroded.get_pixel(x, y)[0];
        Luma([v.saturating_sub(e)])
    });
    normalize_to_full_range(&edge)
}

fn pass3_edge_enhanced_match(img: &GrayImage, ratio: f64, cfg: &AlignmentConfig) -> Option<Quad> {
    let marker = marker_image();
    let marker_edge = erode_subtract(marker, 5);
    let image_edge = erode_subtract(img, 5);
    let centers = find_marker_centers(&image_edge, &marker_edge, ratio, cfg)?;
    Some(alignment::order_corners(centers))
}

// ---- Fallback: contour-based page crop -----------------------------------

fn fallback_contour_crop(img: &GrayImage) -> Option<GrayImage> {
    let flattened = shadow_flatten(img, 21.0);
    let level = otsu_level(&flattened);
    let binary = GrayImage::from_fn(flattened.width(), flattened.height(), |x, y| {
        Luma([if flattened.get_pixel(x, y)[0] >= level { 255 } else { 0 }])
    });
    let closed = {
        let dilated = imageproc::morphology::dilate(&binary, Norm::LInf, 4);
        erode(&dilated, Norm::LInf, 4)
    };

    let contours = find_contours::<i32>(&closed);
    let (width, height) = img.dimensions();
    let image_area = (width as f64) * (height as f64);
    let target_ratio = 1700.0 / 2600.0;

    let mut scored: Vec<(f64, Vec<(f64, f64)>)> = contours
        .iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .filter_map(|c| {
            let points: Vec<(f64, f64)> = c.points.iter().map(|p| (p.x as f64, p.y as f64)).collect();
            let metrics = alignment::polygon_metrics(&points)?;
            Some((metrics.area, points))
        })
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap());
    scored.truncate(25);

    for (area, points) in scored {
        if area < image_area * 0.08 {
            continue;
        }
        let approx = alignment::approx_polygon(&points, 0.05);
        if approx.len() != 4 {
            continue;
        }
        let metrics = alignment::polygon_metrics(&approx)?;
        let w = metrics.bbox.2 - metrics.bbox.0;
        let h = metrics.bbox.3 - metrics.bbox.1;
        if h <= 0.0 {
            continue;
        }
        if ((w / h) - target_ratio).abs() > 0.35 {
            continue;
        }
        let pts: [(f64, f64); 4] = [approx[0], approx[1], approx[2], approx[3]];
        let quad = alignment::order_corners(pts);
        if let Some(warped) = alignment::warp_quad_to_rect(img, &quad, 0.35) {
            return Some(warped);
        }
    }
    None
}

// ---- orchestration --------------------------------------------------------

/// Run the three marker-detection passes in order, falling back to a
/// contour-based page crop, falling back again to the unrectified input.
pub fn rectify(img: &GrayImage, sheet_to_marker_width_ratio: f64, cfg: &AlignmentConfig) -> (GrayImage, RectificationOutcome) {
    if let Some(quad) = pass1_contour_markers(img, sheet_to_marker_width_ratio, cfg) {
        if let Some(warped) = alignment::warp_quad_to_rect(img, &quad, 0.35) {
            debug!("rectified via pass 1 (contour markers)");
            return (warped, RectificationOutcome::ContourMarkers);
        }
    }
    trace!("pass 1 (contour markers) found no acceptable quad");

    if let Some(quad) = pass2_template_match(img, sheet_to_marker_width_ratio, cfg) {
        if let Some(warped) = alignment::warp_quad_to_rect(img, &quad, 0.35) {
            debug!("rectified via pass 2 (template match)");
            return (warped, RectificationOutcome::TemplateMatch);
        }
    }
    trace!("pass 2 (template match) found no acceptable quad");

    if let Some(quad) = pass3_edge_enhanced_match(img, sheet_to_marker_width_ratio, cfg) {
        if let Some(warped) = alignment::warp_quad_to_rect(img, &quad, 0.35) {
            debug!("rectified via pass 3 (edge-enhanced template match)");
            return (warped, RectificationOutcome::EdgeEnhancedMatch);
        }
    }
    trace!("pass 3 (edge-enhanced match) found no acceptable quad");

    if let Some(cropped) = fallback_contour_crop(img) {
        warn!("all marker passes failed; recovered via contour page crop");
        return (cropped, RectificationOutcome::ContourPageCrop);
    }

    warn!("all marker passes and the contour fallback failed; passing through unrectified");
    (img.clone(), RectificationOutcome::Unrectified)
}

/// Normalize and resize to the template's `page_dimensions` (Section 4.B
/// Final step).
pub fn finalize(img: &GrayImage, page_dimensions: (u32, u32)) -> GrayImage {
    let normalized = normalize_to_full_range(img);
    image::imageops::resize(
        &normalized,
        page_dimensions.0,
        page_dimensions.1,
        image::imageops::FilterType::Lanczos3,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn normalize_stretches_narrow_range_to_full_scale() {
        let img = GrayImage::from_fn(4, 4, |_, _| Luma([100u8]));
        let mut img = img;
        img.put_pixel(0, 0, Luma([120]));
        img.put_pixel(3, 3, Luma([80]));
        let normalized = normalize_to_full_range(&img);
        assert_eq!(normalized.get_pixel(0, 0)[0], 255);
        assert_eq!(normalized.get_pixel(3, 3)[0], 0);
    }

    #[test]
    fn decode_base64_strips_data_url_prefix() {
        let white = image::ImageBuffer::from_pixel(8, 8, Luma([255u8]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageLuma8(white)
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageOutputFormat::Png)
            .unwrap();
        let b64 = base64::engine::general_purpose::STANDARD.encode(&bytes);
        let prefixed = format!("data:image/png;base64,{b64}");
        let decoded = decode_image_base64(&prefixed).unwrap();
        assert_eq!(decoded.dimensions(), (8, 8));
    }

    #[test]
    fn finalize_resizes_to_page_dimensions() {
        let img = GrayImage::from_fn(50, 80, |_, _| Luma([200u8]));
        let out = finalize(&img, (100, 160));
        assert_eq!(out.dimensions(), (100, 160));
    }
}
