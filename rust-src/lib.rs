// lib.rs - pipeline orchestrator (Section 4.E): decode -> rectify -> detect -> evaluate -> encode

pub mod alignment;
pub mod bubble_detection;
pub mod config;
pub mod error;
pub mod evaluation;
pub mod image_processing;
pub mod template;

use std::collections::BTreeMap;
use std::io::Cursor;

use base64::Engine;
use image::ImageOutputFormat;
use indexmap::IndexMap;
use tracing::{debug, info_span, warn};

pub use config::{AlignmentConfig, DetectionConfig};
pub use error::{OmrError, OmrResult};
pub use evaluation::{BubbleResult, Correctness, EvaluationResult, MarkingScheme};
pub use image_processing::RectificationOutcome;
pub use template::{ParsedTemplate, TemplateConfig};

/// Raw image input to a scan: either already-decoded bytes, or a (possibly
/// `data:`-prefixed) base64 string, per Section 6.
pub enum ImageInput<'a> {
    Bytes(&'a [u8]),
    Base64(&'a str),
}

/// The per-request tuning knobs a host may override without touching the
/// template JSON (Section 10.3). `Default` reproduces the numeric values
/// named throughout Sections 4.B/4.C.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub detection: DetectionConfig,
    pub alignment: AlignmentConfig,
}

/// Everything the orchestrator returns for one scan (Section 6's output
/// record). `score`/`total`/`percentage`/`bubble_details` are only
/// populated when an answer key was supplied.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub detected_answers: BTreeMap<String, String>,
    pub score: Option<f64>,
    pub total: Option<usize>,
    pub percentage: Option<f64>,
    pub bubble_details: Vec<BubbleResult>,
    pub multi_marked_count: u32,
    pub unmarked_count: u32,
    pub annotated_image_base64: String,
    pub rectification_outcome: RectificationOutcome,
}

/// Run the full A->B->C->D->E pipeline for one scan request.
///
/// `template_config` defaults to the 100-question sheet (Section 6) when
/// `None`. `answer_key`/`marking_scheme` are optional; when no key is
/// supplied the evaluator does not run and the scoring fields are `None`.
pub fn process_omr_image(
    image: ImageInput,
    template_config: Option<&TemplateConfig>,
    answer_key: Option<&IndexMap<String, String>>,
    marking_scheme: Option<MarkingScheme>,
    pipeline_config: Option<&PipelineConfig>,
) -> OmrResult<ScanResult> {
    let span = info_span!("omr_scan");
    let _guard = span.enter();

    let default_config = PipelineConfig::default();
    let pipeline_config = pipeline_config.unwrap_or(&default_config);
    let scheme = marking_scheme.unwrap_or_default();

    let decoded = match image {
        ImageInput::Bytes(bytes) => image_processing::decode_image_bytes(bytes)?,
        ImageInput::Base64(s) => image_processing::decode_image_base64(s)?,
    };
    debug!(width = decoded.width(), height = decoded.height(), "decoded input image");

    let default_template = TemplateConfig::default_template();
    let template_config = template_config.unwrap_or(&default_template);
    let template = ParsedTemplate::parse(template_config, pipeline_config.alignment.default_sheet_to_marker_width_ratio)?;
    debug!(
        blocks = template.field_blocks.len(),
        questions = template.output_columns.len(),
        "parsed template"
    );

    let (rectified, outcome) = image_processing::rectify(
        &decoded,
        template.sheet_to_marker_width_ratio,
        &pipeline_config.alignment,
    );
    if outcome.is_degraded() {
        warn!(?outcome, "preprocessing degraded: no marker pass succeeded");
    } else {
        debug!(?outcome, "preprocessing rectified via marker detection");
    }

    let finalized = image_processing::finalize(&rectified, template.page_dimensions);

    let detection = bubble_detection::detect(&finalized, &template, &pipeline_config.detection);
    debug!(
        unmarked = detection.unmarked_count,
        multi_marked = detection.multi_marked_count,
        "bubble detection complete"
    );

    let (score, total, percentage, bubble_details) = match answer_key {
        Some(key) => {
            let result = evaluation::evaluate(&detection.detected_answers, key, scheme, &detection.intensity_values);
            debug!(score = result.score, total = result.total, "evaluated against answer key");
            (Some(result.score), Some(result.total), result.percentage, result.bubble_details)
        }
        None => (None, None, None, Vec::new()),
    };

    let annotated_image_base64 = encode_jpeg_base64(&detection.annotated_image)?;

    Ok(ScanResult {
        detected_answers: detection.detected_answers,
        score,
        total,
        percentage,
        bubble_details,
        multi_marked_count: detection.multi_marked_count,
        unmarked_count: detection.unmarked_count,
        annotated_image_base64,
        rectification_outcome: outcome,
    })
}

fn encode_jpeg_base64(image: &image::RgbImage) -> OmrResult<String> {
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Jpeg(90))
        .map_err(|e| OmrError::invalid_image(format!("failed to encode annotated image: {e}")))?;
    Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageOutputFormat, Luma};
    use std::io::Cursor;

    fn blank_sheet_png() -> Vec<u8> {
        let img = GrayImage::from_pixel(1700, 2600, Luma([255u8]));
        let mut bytes = Vec::new();
        image::DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn blank_sheet_against_default_template_marks_everything_unmarked() {
        let png = blank_sheet_png();
        let result = process_omr_image(ImageInput::Bytes(&png), None, None, None, None).unwrap();
        assert_eq!(result.detected_answers.len(), 100);
        assert_eq!(result.unmarked_count, 100);
        assert_eq!(result.multi_marked_count, 0);
        assert!(result.detected_answers.values().all(|v| v.is_empty()));
        assert!(result.score.is_none());
        assert!(!result.annotated_image_base64.is_empty());
    }

    #[test]
    fn detected_answers_count_matches_output_columns() {
        let png = blank_sheet_png();
        let result = process_omr_image(ImageInput::Bytes(&png), None, None, None, None).unwrap();
        let template = ParsedTemplate::parse(&TemplateConfig::default_template(), 17.0).unwrap();
        assert_eq!(result.detected_answers.len(), template.output_columns.len());
    }

    #[test]
    fn invalid_image_bytes_produce_invalid_image_error() {
        let err = process_omr_image(ImageInput::Bytes(b"not an image"), None, None, None, None).unwrap_err();
        assert!(matches!(err, OmrError::InvalidImage { .. }));
    }
}
