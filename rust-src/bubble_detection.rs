// bubble_detection.rs - per-bubble fill scoring and per-question marking decisions (Section 4.C)

use std::collections::BTreeMap;
use std::sync::OnceLock;

use ab_glyph::{FontRef, PxScale};
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contrast::otsu_level;
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use rayon::prelude::*;

use crate::config::DetectionConfig;
use crate::template::{Bubble, FieldBlock, ParsedTemplate};

const ANNOTATION_FONT_BYTES: &[u8] = include_bytes!("../assets/DejaVuSans-Bold.ttf");

fn annotation_font() -> &'static FontRef<'static> {
    static FONT: OnceLock<FontRef<'static>> = OnceLock::new();
    FONT.get_or_init(|| FontRef::try_from_slice(ANNOTATION_FONT_BYTES).expect("shipped annotation font is valid"))
}

/// The first-large-gap unsupervised threshold (Section 4.C Phase 2, and the
/// Glossary). `looseness` controls the half-window `ls = (looseness+1)/2`.
/// Returns `(threshold, max_jump)`, or `None` if the list is too short for
/// the requested window.
pub fn first_large_gap(sorted: &[f64], looseness: usize) -> Option<(f64, f64)> {
    let ls = (looseness + 1) / 2;
    let n = sorted.len();
    if n < 2 * ls + 1 {
        return None;
    }
    let mut best_jump = f64::MIN;
    let mut best_threshold = sorted[0];
    for i in ls..(n - ls) {
        let jump = sorted[i + ls] - sorted[i - ls];
        if jump > best_jump {
            best_jump = jump;
            best_threshold = sorted[i - ls] + jump / 2.0;
        }
    }
    Some((best_threshold, best_jump))
}

fn global_threshold(sorted_means: &[f64], cfg: &DetectionConfig) -> f64 {
    match first_large_gap(sorted_means, 4) {
        Some((threshold, jump)) if jump > cfg.min_jump => threshold,
        _ => cfg.global_threshold_default(),
    }
}

fn global_std_threshold(sorted_std_devs: &[f64], cfg: &DetectionConfig) -> f64 {
    match first_large_gap(sorted_std_devs, 1) {
        Some((threshold, jump)) if jump > cfg.min_jump => threshold,
        _ => cfg.global_threshold_default(),
    }
}

fn per_strip_threshold(means: &[f64], global_thr: f64, cfg: &DetectionConfig) -> f64 {
    let n = means.len();
    if n < 3 {
        let min = means.iter().cloned().fold(f64::MAX, f64::min);
        let max = means.iter().cloned().fold(f64::MIN, f64::max);
        return if max - min < cfg.min_gap {
            global_thr
        } else {
            means.iter().sum::<f64>() / n.max(1) as f64
        };
    }

    let mut sorted = means.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let (local_threshold, max_jump) = first_large_gap(&sorted, 2).unwrap_or((global_thr, 0.0));

    let mut result = if max_jump < cfg.confident_jump_gate() {
        global_thr
    } else {
        local_threshold
    };

    let min = sorted[0];
    let max = sorted[n - 1];
    if result >= max {
        result = (min + max) / 2.0;
    } else if result <= min {
        result = global_thr;
    }
    result
}

// ---- Phase 1: per-bubble features -----------------------------------------

struct Masks {
    core: Vec<bool>,
    ring: Vec<bool>,
    core_count: usize,
}

fn build_masks(w: u32, h: u32) -> Masks {
    let min_dim = w.min(h) as f64;
    let core_r = (0.28 * min_dim).max(4.0);
    let ring_r = (0.42 * min_dim).max(core_r + 2.0);
    let cx = w as f64 / 2.0;
    let cy = h as f64 / 2.0;

    let mut core = vec![false; (w * h) as usize];
    let mut ring = vec![false; (w * h) as usize];
    let mut core_count = 0usize;
    for y in 0..h {
        for x in 0..w {
            let dx = x as f64 + 0.5 - cx;
            let dy = y as f64 + 0.5 - cy;
            let d = (dx * dx + dy * dy).sqrt();
            let idx = (y * w + x) as usize;
            if d <= core_r {
                core[idx] = true;
                core_count += 1;
            } else if d <= ring_r {
                ring[idx] = true;
            }
        }
    }
    Masks { core, ring, core_count }
}

#[derive(Debug, Clone, Copy)]
struct BubbleFeature {
    core_mean: f32,
    fill_ratio: f32,
    /// `max(0, ring_mean - core_mean)`; diagnostic only (Section 4.C Phase 1
    /// step 5), not consulted by the marking decision.
    contrast_darkness: f32,
    /// `contrast_darkness + fill_ratio * 85`; diagnostic only (Section 4.C
    /// Phase 1 step 7), not consulted by the marking decision.
    score: f32,
}

fn sentinel_feature() -> BubbleFeature {
    BubbleFeature { core_mean: 255.0, fill_ratio: 0.0, contrast_darkness: 0.0, score: 0.0 }
}

fn extract_feature(img: &GrayImage, bubble_x: i64, bubble_y: i64, w: u32, h: u32, masks: &Masks) -> BubbleFeature {
    if bubble_x < 0 || bubble_y < 0 {
        return sentinel_feature();
    }
    let (bx, by) = (bubble_x as u32, bubble_y as u32);
    if bx + w > img.width() || by + h > img.height() {
        return sentinel_feature();
    }

    let roi = image::imageops::crop_imm(img, bx, by, w, h).to_image();
    let blurred = imageproc::filter::gaussian_blur_f32(&roi, 0.6);

    let mut core_sum = 0f64;
    let mut ring_sum = 0f64;
    let mut ring_count = 0usize;
    for y in 0..h {
        for x in 0..w {
            let idx = (y * w + x) as usize;
            let v = blurred.get_pixel(x, y)[0] as f64;
            if masks.core[idx] {
                core_sum += v;
            } else if masks.ring[idx] {
                ring_sum += v;
                ring_count += 1;
            }
        }
    }
    let core_mean = (core_sum / masks.core_count.max(1) as f64) as f32;
    let ring_mean = (ring_sum / ring_count.max(1) as f64) as f32;
    let contrast_darkness = (ring_mean - core_mean).max(0.0);

    let level = otsu_level(&blurred);
    let mut filled = 0usize;
    for y in 0..h {
        for x in 0..w {
            let idx = (y * w + x) as usize;
            if masks.core[idx] && blurred.get_pixel(x, y)[0] < level {
                filled += 1;
            }
        }
    }
    let fill_ratio = filled as f32 / masks.core_count.max(1) as f32;
    let score = contrast_darkness + fill_ratio * 85.0;

    BubbleFeature { core_mean, fill_ratio, contrast_darkness, score }
}

struct StripFeatures<'a> {
    field_label: String,
    bubbles: &'a [Bubble],
    features: Vec<BubbleFeature>,
}

impl<'a> StripFeatures<'a> {
    fn means(&self) -> Vec<f64> {
        self.features.iter().map(|f| f.core_mean as f64).collect()
    }

    fn std_dev(&self) -> f64 {
        let means = self.means();
        let n = means.len().max(1) as f64;
        let mean = means.iter().sum::<f64>() / n;
        (means.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / n).sqrt()
    }
}

fn extract_block_strips<'a>(image: &GrayImage, block: &'a FieldBlock) -> Vec<StripFeatures<'a>> {
    let (w, h) = block.bubble_dimensions;
    let masks = build_masks(w, h);
    block
        .traverse_bubbles
        .iter()
        .enumerate()
        .map(|(i, bubbles)| {
            let features = bubbles
                .iter()
                .map(|b| extract_feature(image, b.x + block.shift, b.y, w, h, &masks))
                .collect();
            StripFeatures {
                field_label: block.field_labels[i].clone(),
                bubbles,
                features,
            }
        })
        .collect()
}

// ---- Phase 3: per-strip decision -------------------------------------------

fn select_marked_indices(strip: &StripFeatures, global_thr: f64, cfg: &DetectionConfig) -> Vec<usize> {
    let n = strip.features.len();
    let means: Vec<f64> = strip.means();
    let threshold = per_strip_threshold(&means, global_thr, cfg);

    let mut marked: Vec<usize> = (0..n).filter(|&i| means[i] < threshold).collect();

    if n == 1 {
        // A single-choice strip has no "next" bubble to gap-check against;
        // the plain threshold comparison is the whole decision.
    } else if n > 0 && marked.len() == n {
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| means[a].partial_cmp(&means[b]).unwrap());
        let (darkest, next) = (order[0], order[1.min(n - 1)]);
        marked = if n >= 2 && means[next] - means[darkest] >= cfg.single_mark_gap {
            vec![darkest]
        } else {
            vec![]
        };
    } else if marked.len() > 1 {
        let mut order = marked.clone();
        order.sort_by(|&a, &b| means[a].partial_cmp(&means[b]).unwrap());
        let (darkest, next) = (order[0], order[1]);
        marked = if means[next] - means[darkest] >= cfg.single_mark_gap {
            vec![darkest]
        } else {
            let ceiling = means[darkest] + cfg.multi_mark_near_gap;
            marked.into_iter().filter(|&i| means[i] <= ceiling).collect()
        };
    }

    // Fill-ratio override (Section 4.C step 5).
    let mut by_fill: Vec<usize> = (0..n).collect();
    by_fill.sort_by(|&a, &b| {
        strip.features[b]
            .fill_ratio
            .partial_cmp(&strip.features[a].fill_ratio)
            .unwrap()
    });
    if n > 0 {
        let top = strip.features[by_fill[0]].fill_ratio as f64;
        let second = if n > 1 { strip.features[by_fill[1]].fill_ratio as f64 } else { 0.0 };
        let gap = top - second;
        if marked.is_empty() && top >= cfg.fill_ratio_force_mark && gap >= cfg.fill_ratio_min_gap {
            marked = vec![by_fill[0]];
        } else if marked.len() >= 2 && top >= cfg.fill_ratio_collapse_mark && gap >= cfg.fill_ratio_min_gap {
            marked = vec![by_fill[0]];
        }
    }

    marked
}

// ---- public surface ---------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub detected_answers: BTreeMap<String, String>,
    pub intensity_values: BTreeMap<String, Vec<f32>>,
    pub annotated_image: RgbImage,
    pub unmarked_count: u32,
    pub multi_marked_count: u32,
}

pub fn detect(image: &GrayImage, template: &ParsedTemplate, cfg: &DetectionConfig) -> DetectionResult {
    let per_block_strips: Vec<Vec<StripFeatures>> = template
        .field_blocks
        .par_iter()
        .map(|block| extract_block_strips(image, block))
        .collect();

    let all_strips: Vec<&StripFeatures> = per_block_strips.iter().flatten().collect();

    let mut all_means: Vec<f64> = all_strips.iter().flat_map(|s| s.means()).collect();
    all_means.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let global_thr = global_threshold(&all_means, cfg);

    let mut all_std_devs: Vec<f64> = all_strips.iter().map(|s| s.std_dev()).collect();
    all_std_devs.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let _global_std_thresh = global_std_threshold(&all_std_devs, cfg);

    let mut detected_answers = BTreeMap::new();
    let mut intensity_values = BTreeMap::new();
    let mut unmarked_count = 0u32;
    let mut multi_marked_count = 0u32;

    let mut annotated = RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let v = image.get_pixel(x, y)[0];
        Rgb([v, v, v])
    });

    for (block, strips) in template.field_blocks.iter().zip(per_block_strips.iter()) {
        for strip in strips {
            let marked = select_marked_indices(strip, global_thr, cfg);
            intensity_values.insert(
                strip.field_label.clone(),
                strip.features.iter().map(|f| f.core_mean).collect(),
            );

            let value = match marked.len() {
                0 => {
                    unmarked_count += 1;
                    block.empty_value.clone()
                }
                1 => strip.bubbles[marked[0]].field_value.clone(),
                _ => {
                    multi_marked_count += 1;
                    marked.iter().map(|&i| strip.bubbles[i].field_value.clone()).collect()
                }
            };
            detected_answers.insert(strip.field_label.clone(), value);

            annotate_strip(&mut annotated, strip.bubbles, block, &marked);
        }
    }

    DetectionResult {
        detected_answers,
        intensity_values,
        annotated_image: annotated,
        unmarked_count,
        multi_marked_count,
    }
}

fn annotate_strip(canvas: &mut RgbImage, bubbles: &[Bubble], block: &FieldBlock, marked: &[usize]) {
    let (w, h) = block.bubble_dimensions;
    let font = annotation_font();
    for (i, bubble) in bubbles.iter().enumerate() {
        let x = (bubble.x + block.shift).max(0) as i32;
        let y = bubble.y.max(0) as i32;
        let is_marked = marked.contains(&i);
        let inset = if is_marked { (w as f32 / 12.0) as i32 } else { (w as f32 / 10.0) as i32 };
        let rect_w = (w as i32 - 2 * inset).max(1) as u32;
        let rect_h = (h as i32 - 2 * inset).max(1) as u32;
        let rect = Rect::at(x + inset, y + inset).of_size(rect_w, rect_h);

        if is_marked {
            let green = Rgb([30u8, 180, 60]);
            draw_hollow_rect_mut(canvas, rect, green);
            draw_hollow_rect_mut(canvas, Rect::at(x + inset + 1, y + inset + 1).of_size(rect_w.saturating_sub(2).max(1), rect_h.saturating_sub(2).max(1)), green);
            draw_text_mut(
                canvas,
                green,
                x + inset,
                y + inset,
                PxScale::from(h as f32 * 0.7),
                font,
                &bubble.field_value,
            );
        } else {
            draw_hollow_rect_mut(canvas, rect, Rgb([160u8, 160, 160]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_large_gap_finds_midpoint_of_single_gap() {
        let values = vec![10.0, 11.0, 12.0, 80.0, 81.0, 82.0];
        let (threshold, jump) = first_large_gap(&values, 1).unwrap();
        assert!(jump >= 60.0);
        assert!((threshold - 46.0).abs() < 1.0);
    }

    #[test]
    fn global_threshold_falls_back_when_no_large_gap() {
        let cfg = DetectionConfig::default();
        let values: Vec<f64> = (0..20).map(|i| 100.0 + i as f64 * 0.1).collect();
        let thr = global_threshold(&values, &cfg);
        assert_eq!(thr, cfg.global_threshold_default());
    }

    #[test]
    fn identical_means_mark_nothing() {
        let cfg = DetectionConfig::default();
        let bubbles: Vec<Bubble> = (0..5)
            .map(|i| Bubble { x: i * 10, y: 0, field_label: "q1".into(), field_value: ((b'A' + i as u8) as char).to_string() })
            .collect();
        let features = vec![BubbleFeature { core_mean: 180.0, fill_ratio: 0.0, contrast_darkness: 0.0, score: 0.0 }; 5];
        let strip = StripFeatures { field_label: "q1".into(), bubbles: &bubbles, features };
        let marked = select_marked_indices(&strip, 200.0, &cfg);
        assert!(marked.is_empty());
    }

    fn make_strip(bubbles: &[Bubble], means: &[f32], fill_ratios: &[f32]) -> StripFeatures<'_> {
        let features = means
            .iter()
            .zip(fill_ratios)
            .map(|(&core_mean, &fill_ratio)| BubbleFeature {
                core_mean,
                fill_ratio,
                contrast_darkness: 0.0,
                score: fill_ratio * 85.0,
            })
            .collect();
        StripFeatures { field_label: "q1".into(), bubbles, features }
    }

    fn mcq5_bubbles() -> Vec<Bubble> {
        (0..5)
            .map(|i| Bubble { x: i * 57, y: 0, field_label: "q1".into(), field_value: ((b'A' + i as u8) as char).to_string() })
            .collect()
    }

    /// Two near-darkest bubbles within `MULTI_MARK_NEAR_GAP` of each other
    /// are both kept as a tie (Section 4.C Phase 3 step 4).
    #[test]
    fn two_near_darkest_bubbles_stay_as_multi_mark_tie() {
        let cfg = DetectionConfig::default();
        let bubbles = mcq5_bubbles();
        let strip = make_strip(&bubbles, &[60.0, 62.0, 200.0, 205.0, 210.0], &[0.5, 0.5, 0.0, 0.0, 0.0]);
        let marked = select_marked_indices(&strip, 200.0, &cfg);
        assert_eq!(marked, vec![0, 1]);
    }

    /// A single clearly-darkest bubble (gap >= SINGLE_MARK_GAP) is kept alone
    /// even though the threshold pass initially marks several.
    #[test]
    fn clearly_darkest_bubble_is_kept_alone() {
        let cfg = DetectionConfig::default();
        let bubbles = mcq5_bubbles();
        let strip = make_strip(&bubbles, &[60.0, 120.0, 200.0, 205.0, 210.0], &[0.5, 0.3, 0.0, 0.0, 0.0]);
        let marked = select_marked_indices(&strip, 200.0, &cfg);
        assert_eq!(marked, vec![0]);
    }

    /// Fill-ratio override: the threshold pass marks nothing, but a faint
    /// mark still clears `fill_ratio_force_mark`/`fill_ratio_min_gap`
    /// (Section 4.C Phase 3 step 5, spec seed scenario 5).
    #[test]
    fn fill_ratio_override_force_marks_a_faint_single_choice() {
        let cfg = DetectionConfig::default();
        let bubbles = mcq5_bubbles();
        let strip = make_strip(&bubbles, &[250.0, 251.0, 252.0, 253.0, 254.0], &[0.08, 0.05, 0.05, 0.05, 0.05]);
        let marked = select_marked_indices(&strip, 200.0, &cfg);
        assert_eq!(marked, vec![0]);
    }

    /// Fill-ratio override also collapses a threshold pass that over-marks
    /// (>=2 bubbles) down to the single best-filled choice.
    #[test]
    fn fill_ratio_override_collapses_overmarked_strip_to_top() {
        let cfg = DetectionConfig::default();
        let bubbles = mcq5_bubbles();
        // threshold pass marks indices 0 and 1 (tie, gap < 8); fill ratios
        // clearly favor index 0.
        let strip = make_strip(&bubbles, &[60.0, 62.0, 200.0, 205.0, 210.0], &[0.5, 0.1, 0.0, 0.0, 0.0]);
        let marked = select_marked_indices(&strip, 200.0, &cfg);
        assert_eq!(marked, vec![0]);
    }
}
