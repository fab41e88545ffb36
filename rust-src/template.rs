// template.rs - sheet geometry: JSON configuration -> explicit bubble grid

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{OmrError, OmrResult};

/// The closed set of symbolic question shapes a block may declare instead of
/// spelling out `bubble_values`/`direction` itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    #[serde(rename = "QTYPE_MCQ4")]
    Mcq4,
    #[serde(rename = "QTYPE_MCQ5")]
    Mcq5,
    #[serde(rename = "QTYPE_INT")]
    Int,
    #[serde(rename = "QTYPE_INT_FROM_1")]
    IntFromOne,
}

impl FieldType {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "QTYPE_MCQ4" => Some(FieldType::Mcq4),
            "QTYPE_MCQ5" => Some(FieldType::Mcq5),
            "QTYPE_INT" => Some(FieldType::Int),
            "QTYPE_INT_FROM_1" => Some(FieldType::IntFromOne),
            _ => None,
        }
    }

    /// The registry entry this type always contributes: `bubble_values` and
    /// `direction`. These two fields always win over whatever a block config
    /// might otherwise specify, because the registry is the only source for
    /// them once a `field_type` is named (Section 4.A step 1).
    fn registry_entry(self) -> (&'static [&'static str], Direction) {
        match self {
            FieldType::Mcq4 => (&["A", "B", "C", "D"], Direction::Horizontal),
            FieldType::Mcq5 => (&["A", "B", "C", "D", "E"], Direction::Horizontal),
            FieldType::Int => (
                &["0", "1", "2", "3", "4", "5", "6", "7", "8", "9"],
                Direction::Vertical,
            ),
            FieldType::IntFromOne => (
                &["1", "2", "3", "4", "5", "6", "7", "8", "9", "0"],
                Direction::Vertical,
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Horizontal,
    Vertical,
}

impl Direction {
    /// (bubble_step, label_step) as (dx, dy) unit vectors: stepping between
    /// choices within one question moves along `bubble_step`; stepping to
    /// the next question moves along `label_step`.
    fn steps(self) -> ((f64, f64), (f64, f64)) {
        match self {
            Direction::Horizontal => ((1.0, 0.0), (0.0, 1.0)),
            Direction::Vertical => ((0.0, 1.0), (1.0, 0.0)),
        }
    }
}

// ---- raw configuration tree (Section 6 schema) -----------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateConfig {
    #[serde(default)]
    pub page_dimensions: Option<(u32, u32)>,
    #[serde(default)]
    pub bubble_dimensions: Option<(u32, u32)>,
    #[serde(default)]
    pub empty_value: Option<String>,
    #[serde(default)]
    pub output_columns: Vec<String>,
    pub field_blocks: IndexMap<String, BlockConfig>,
    #[serde(default)]
    pub pre_processors: Vec<PreProcessorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockConfig {
    #[serde(default)]
    pub field_type: Option<String>,
    #[serde(default)]
    pub bubble_values: Option<Vec<String>>,
    #[serde(default)]
    pub direction: Option<Direction>,
    pub origin: Option<(f64, f64)>,
    #[serde(default)]
    pub field_labels: Option<Vec<String>>,
    pub bubbles_gap: Option<f64>,
    pub labels_gap: Option<f64>,
    #[serde(default)]
    pub bubble_dimensions: Option<(u32, u32)>,
    #[serde(default)]
    pub empty_value: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreProcessorConfig {
    pub name: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

impl TemplateConfig {
    /// The 100-question, four-column, five-choice default (Section 6).
    pub fn default_template() -> Self {
        let json = serde_json::json!({
            "pageDimensions": [1700, 2600],
            "bubbleDimensions": [42, 42],
            "emptyValue": "",
            "fieldBlocks": {
                "Column1_Q1_25": {
                    "fieldType": "QTYPE_MCQ5",
                    "origin": [90, 680],
                    "fieldLabels": (1..=25).map(|i| format!("q{i}")).collect::<Vec<_>>(),
                    "bubblesGap": 57,
                    "labelsGap": 75.6
                },
                "Column2_Q26_50": {
                    "fieldType": "QTYPE_MCQ5",
                    "origin": [530, 680],
                    "fieldLabels": (26..=50).map(|i| format!("q{i}")).collect::<Vec<_>>(),
                    "bubblesGap": 57,
                    "labelsGap": 75.6
                },
                "Column3_Q51_75": {
                    "fieldType": "QTYPE_MCQ5",
                    "origin": [970, 680],
                    "fieldLabels": (51..=75).map(|i| format!("q{i}")).collect::<Vec<_>>(),
                    "bubblesGap": 57,
                    "labelsGap": 75.6
                },
                "Column4_Q76_100": {
                    "fieldType": "QTYPE_MCQ5",
                    "origin": [1410, 680],
                    "fieldLabels": (76..=100).map(|i| format!("q{i}")).collect::<Vec<_>>(),
                    "bubblesGap": 57,
                    "labelsGap": 75.6
                }
            }
        });
        serde_json::from_value(json).expect("default template literal is well-formed")
    }
}

// ---- computed model (Section 3) ---------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bubble {
    pub x: i64,
    pub y: i64,
    pub field_label: String,
    pub field_value: String,
}

#[derive(Debug, Clone)]
pub struct FieldBlock {
    pub name: String,
    pub origin: (f64, f64),
    pub bubble_dimensions: (u32, u32),
    pub direction: Direction,
    pub field_labels: Vec<String>,
    pub bubble_values: Vec<String>,
    pub bubbles_gap: f64,
    pub labels_gap: f64,
    pub empty_value: String,
    /// Always zero in this implementation; see Section 9's open question.
    pub shift: i64,
    /// `traverse_bubbles[question_index][choice_index]`.
    pub traverse_bubbles: Vec<Vec<Bubble>>,
}

impl FieldBlock {
    /// Outer `(along_bubble_axis, along_label_axis)` extent of the block, in
    /// pixels, per Section 4.A step 5.
    pub fn outer_dimensions(&self) -> (f64, f64) {
        let (bw, bh) = (self.bubble_dimensions.0 as f64, self.bubble_dimensions.1 as f64);
        let bubble_dim_on_bubble_axis = match self.direction {
            Direction::Horizontal => bw,
            Direction::Vertical => bh,
        };
        let bubble_dim_on_label_axis = match self.direction {
            Direction::Horizontal => bh,
            Direction::Vertical => bw,
        };
        let n_values = self.bubble_values.len().max(1) as f64;
        let n_labels = self.field_labels.len().max(1) as f64;
        (
            self.bubbles_gap * (n_values - 1.0) + bubble_dim_on_bubble_axis,
            self.labels_gap * (n_labels - 1.0) + bubble_dim_on_label_axis,
        )
    }
}

#[derive(Debug, Clone)]
pub struct ParsedTemplate {
    pub page_dimensions: (u32, u32),
    pub bubble_dimensions: (u32, u32),
    pub empty_value: String,
    pub field_blocks: Vec<FieldBlock>,
    pub output_columns: Vec<String>,
    pub sheet_to_marker_width_ratio: f64,
}

impl ParsedTemplate {
    pub fn parse(config: &TemplateConfig, default_ratio: f64) -> OmrResult<Self> {
        if config.field_blocks.is_empty() {
            return Err(OmrError::invalid_template("fieldBlocks must not be empty"));
        }

        let page_dimensions = config.page_dimensions.unwrap_or((1700, 2600));
        let bubble_dimensions = config.bubble_dimensions.unwrap_or((42, 42));
        let empty_value = config.empty_value.clone().unwrap_or_default();

        let mut field_blocks = Vec::with_capacity(config.field_blocks.len());
        let mut auto_output_columns = Vec::new();

        for (name, block_cfg) in &config.field_blocks {
            let block = Self::parse_block(name, block_cfg, bubble_dimensions, &empty_value)?;
            auto_output_columns.extend(block.field_labels.iter().cloned());
            field_blocks.push(block);
        }

        let total_bubbles: usize = field_blocks
            .iter()
            .map(|b| b.traverse_bubbles.iter().map(|row| row.len()).sum::<usize>())
            .sum();
        if total_bubbles == 0 {
            return Err(OmrError::invalid_template(
                "template expansion produced zero bubbles",
            ));
        }

        let output_columns = if config.output_columns.is_empty() {
            auto_output_columns
        } else {
            config.output_columns.clone()
        };

        let sheet_to_marker_width_ratio = config
            .pre_processors
            .iter()
            .find(|p| p.name == "CropOnMarkers")
            .and_then(|p| p.options.get("sheetToMarkerWidthRatio"))
            .and_then(|v| v.as_f64())
            .unwrap_or(default_ratio);

        Ok(ParsedTemplate {
            page_dimensions,
            bubble_dimensions,
            empty_value,
            field_blocks,
            output_columns,
            sheet_to_marker_width_ratio,
        })
    }

    fn parse_block(
        name: &str,
        cfg: &BlockConfig,
        template_bubble_dim: (u32, u32),
        template_empty_value: &str,
    ) -> OmrResult<FieldBlock> {
        let (bubble_values, direction) = match cfg.field_type.as_deref() {
            Some(raw) => {
                let ft = FieldType::parse(raw)
                    .ok_or_else(|| OmrError::invalid_block(name, format!("unknown fieldType `{raw}`")))?;
                let (registry_values, registry_direction) = ft.registry_entry();
                (
                    registry_values.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                    registry_direction,
                )
            }
            None => {
                let values = cfg
                    .bubble_values
                    .clone()
                    .ok_or_else(|| OmrError::invalid_block(name, "missing bubbleValues"))?;
                let direction = cfg
                    .direction
                    .ok_or_else(|| OmrError::invalid_block(name, "missing direction"))?;
                (values, direction)
            }
        };

        let origin = cfg
            .origin
            .ok_or_else(|| OmrError::invalid_block(name, "missing origin"))?;
        let field_labels = cfg
            .field_labels
            .clone()
            .ok_or_else(|| OmrError::invalid_block(name, "missing fieldLabels"))?;
        let bubbles_gap = cfg
            .bubbles_gap
            .ok_or_else(|| OmrError::invalid_block(name, "missing bubblesGap"))?;
        let labels_gap = cfg
            .labels_gap
            .ok_or_else(|| OmrError::invalid_block(name, "missing labelsGap"))?;
        let bubble_dimensions = cfg.bubble_dimensions.unwrap_or(template_bubble_dim);
        let empty_value = cfg
            .empty_value
            .clone()
            .unwrap_or_else(|| template_empty_value.to_string());

        let (bubble_step, label_step) = direction.steps();
        let mut traverse_bubbles = Vec::with_capacity(field_labels.len());
        let mut lead_point = origin;
        for label in &field_labels {
            let mut bubble_point = lead_point;
            let mut row = Vec::with_capacity(bubble_values.len());
            for value in &bubble_values {
                row.push(Bubble {
                    x: bubble_point.0.round() as i64,
                    y: bubble_point.1.round() as i64,
                    field_label: label.clone(),
                    field_value: value.clone(),
                });
                bubble_point.0 += bubble_step.0 * bubbles_gap;
                bubble_point.1 += bubble_step.1 * bubbles_gap;
            }
            traverse_bubbles.push(row);
            lead_point.0 += label_step.0 * labels_gap;
            lead_point.1 += label_step.1 * labels_gap;
        }

        Ok(FieldBlock {
            name: name.to_string(),
            origin,
            bubble_dimensions,
            direction,
            field_labels,
            bubble_values,
            bubbles_gap,
            labels_gap,
            empty_value,
            shift: 0,
            traverse_bubbles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_template_has_100_questions_5_choices() {
        let cfg = TemplateConfig::default_template();
        let template = ParsedTemplate::parse(&cfg, 17.0).unwrap();
        assert_eq!(template.output_columns.len(), 100);
        assert_eq!(template.field_blocks.len(), 4);
        for block in &template.field_blocks {
            assert_eq!(block.traverse_bubbles.len(), 25);
            for row in &block.traverse_bubbles {
                assert_eq!(row.len(), 5);
            }
        }
    }

    #[test]
    fn grid_generation_is_deterministic() {
        let cfg = TemplateConfig::default_template();
        let a = ParsedTemplate::parse(&cfg, 17.0).unwrap();
        let b = ParsedTemplate::parse(&cfg, 17.0).unwrap();
        let coords = |t: &ParsedTemplate| {
            t.field_blocks[0].traverse_bubbles[0]
                .iter()
                .map(|bub| (bub.x, bub.y))
                .collect::<Vec<_>>()
        };
        assert_eq!(coords(&a), coords(&b));
    }

    #[test]
    fn horizontal_block_steps_x_within_question_and_y_between_questions() {
        let mut fb = IndexMap::new();
        fb.insert(
            "Q".to_string(),
            BlockConfig {
                field_type: Some("QTYPE_MCQ4".to_string()),
                bubble_values: None,
                direction: None,
                origin: Some((10.0, 20.0)),
                field_labels: Some(vec!["q1".into(), "q2".into()]),
                bubbles_gap: Some(30.0),
                labels_gap: Some(40.0),
                bubble_dimensions: None,
                empty_value: None,
            },
        );
        let cfg = TemplateConfig {
            page_dimensions: Some((500, 500)),
            bubble_dimensions: Some((20, 20)),
            empty_value: Some("".into()),
            output_columns: vec![],
            field_blocks: fb,
            pre_processors: vec![],
        };
        let template = ParsedTemplate::parse(&cfg, 17.0).unwrap();
        let block = &template.field_blocks[0];
        assert_eq!(block.traverse_bubbles[0][0].x, 10);
        assert_eq!(block.traverse_bubbles[0][0].y, 20);
        assert_eq!(block.traverse_bubbles[0][1].x, 40);
        assert_eq!(block.traverse_bubbles[0][1].y, 20);
        assert_eq!(block.traverse_bubbles[1][0].x, 10);
        assert_eq!(block.traverse_bubbles[1][0].y, 60);
    }

    #[test]
    fn missing_required_key_is_invalid_template() {
        let mut fb = IndexMap::new();
        fb.insert(
            "Q".to_string(),
            BlockConfig {
                field_type: Some("QTYPE_MCQ4".to_string()),
                bubble_values: None,
                direction: None,
                origin: None,
                field_labels: Some(vec!["q1".into()]),
                bubbles_gap: Some(30.0),
                labels_gap: Some(40.0),
                bubble_dimensions: None,
                empty_value: None,
            },
        );
        let cfg = TemplateConfig {
            page_dimensions: None,
            bubble_dimensions: None,
            empty_value: None,
            output_columns: vec![],
            field_blocks: fb,
            pre_processors: vec![],
        };
        let err = ParsedTemplate::parse(&cfg, 17.0).unwrap_err();
        assert!(matches!(err, OmrError::InvalidTemplate { .. }));
    }

    #[test]
    fn unknown_field_type_is_invalid_template() {
        let mut fb = IndexMap::new();
        fb.insert(
            "Q".to_string(),
            BlockConfig {
                field_type: Some("QTYPE_NOPE".to_string()),
                bubble_values: None,
                direction: None,
                origin: Some((0.0, 0.0)),
                field_labels: Some(vec!["q1".into()]),
                bubbles_gap: Some(30.0),
                labels_gap: Some(40.0),
                bubble_dimensions: None,
                empty_value: None,
            },
        );
        let cfg = TemplateConfig {
            page_dimensions: None,
            bubble_dimensions: None,
            empty_value: None,
            output_columns: vec![],
            field_blocks: fb,
            pre_processors: vec![],
        };
        let err = ParsedTemplate::parse(&cfg, 17.0).unwrap_err();
        assert!(matches!(err, OmrError::InvalidTemplate { .. }));
    }
}
