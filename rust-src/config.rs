// config.rs - tuning constants for preprocessing and bubble detection

use serde::{Deserialize, Serialize};

/// Grouped numeric tuning for the detector's threshold heuristics. This is a
/// separate surface from the template (which describes the sheet's
/// geometry, not how aggressively to threshold it) — a host app can tune
/// these without touching template JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectionConfig {
    /// Minimum jump size (in intensity units) for the first-large-gap
    /// algorithm to treat a gap as real rather than falling back to a fixed
    /// page-type default.
    pub min_jump: f64,
    /// Added to `min_jump` to form the confident-jump gate a per-strip
    /// local threshold must clear before it is trusted over the sheet-wide
    /// global threshold.
    pub confident_surplus: f64,
    /// Unused by the midpoint jump algorithm itself but carried as the
    /// scaffold's tuning knob for future jump-sensitivity experiments.
    pub jump_delta: f64,
    /// Strips with fewer than three bubbles fall back to their own mean
    /// unless their min-max spread is below this gap.
    pub min_gap: f64,
    /// A single darkest bubble must out-darken the runner-up by at least
    /// this much to be kept alone when thresholding marks every bubble or
    /// more than one bubble.
    pub single_mark_gap: f64,
    /// Bubbles within this gap of the darkest one are all kept as ties.
    pub multi_mark_near_gap: f64,
    /// Fixed fallback threshold when no large gap is found, for bright
    /// ("white") sheets.
    pub global_threshold_white: f64,
    /// Fixed fallback threshold for "black" page type sheets.
    pub global_threshold_black: f64,
    pub page_type: PageType,
    /// Fill-ratio override thresholds (Section 4.C step 5).
    pub fill_ratio_force_mark: f64,
    pub fill_ratio_collapse_mark: f64,
    pub fill_ratio_min_gap: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PageType {
    White,
    Black,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_jump: 25.0,
            confident_surplus: 25.0,
            jump_delta: 30.0,
            min_gap: 30.0,
            single_mark_gap: 8.0,
            multi_mark_near_gap: 6.0,
            global_threshold_white: 200.0,
            global_threshold_black: 100.0,
            page_type: PageType::White,
            fill_ratio_force_mark: 0.06,
            fill_ratio_collapse_mark: 0.07,
            fill_ratio_min_gap: 0.015,
        }
    }
}

impl DetectionConfig {
    pub fn confident_jump_gate(&self) -> f64 {
        self.min_jump + self.confident_surplus
    }

    pub fn global_threshold_default(&self) -> f64 {
        match self.page_type {
            PageType::White => self.global_threshold_white,
            PageType::Black => self.global_threshold_black,
        }
    }
}

/// Tuning for the perspective-rectification passes (Section 4.B).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlignmentConfig {
    /// Default `sheetToMarkerWidthRatio` used when the template's
    /// `preProcessors` list has no `CropOnMarkers` entry.
    pub default_sheet_to_marker_width_ratio: f64,
    pub min_matching_threshold: f32,
    pub max_matching_variation: f32,
    pub scale_steps: u32,
    /// Shadow-flatten Gaussian blur sigma.
    pub shadow_blur_sigma: f32,
    /// Adaptive-threshold block size for Pass 1 contour detection.
    pub adaptive_block_size: u32,
    /// Adaptive-threshold C offset for Pass 1 contour detection.
    pub adaptive_c: f32,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            default_sheet_to_marker_width_ratio: 17.0,
            min_matching_threshold: 0.3,
            max_matching_variation: 0.41,
            scale_steps: 10,
            shadow_blur_sigma: 21.0,
            adaptive_block_size: 31,
            adaptive_c: 7.0,
        }
    }
}

/// Pixel dimensions of a single bubble, used as the template default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BubbleDimensions {
    pub width: u32,
    pub height: u32,
}

impl Default for BubbleDimensions {
    fn default() -> Self {
        Self {
            width: 42,
            height: 42,
        }
    }
}
