// evaluation.rs - compare detections to an answer key under a marking scheme (Section 4.D)

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// `{correct, incorrect, unmarked}` point weights. Defaults to `(1, 0, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarkingScheme {
    pub correct: f64,
    pub incorrect: f64,
    pub unmarked: f64,
}

impl Default for MarkingScheme {
    fn default() -> Self {
        Self { correct: 1.0, incorrect: 0.0, unmarked: 0.0 }
    }
}

/// Tri-state correctness: `Some(true)` correct, `Some(false)` incorrect,
/// `None` unmarked.
pub type Correctness = Option<bool>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BubbleResult {
    pub question: String,
    pub marked: String,
    pub correct: String,
    pub is_correct: Correctness,
    pub intensity_values: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub score: f64,
    pub total: usize,
    pub percentage: Option<f64>,
    pub bubble_details: Vec<BubbleResult>,
}

/// The trailing run of digits of a question key, used as the sort key
/// (Section 4.D: "q17" -> 17; non-numeric keys sort as 0, ties preserve
/// insertion order).
fn trailing_integer(label: &str) -> u64 {
    let digits: String = label.chars().rev().take_while(|c| c.is_ascii_digit()).collect();
    digits.chars().rev().collect::<String>().parse().unwrap_or(0)
}

pub fn evaluate(
    detected: &BTreeMap<String, String>,
    answer_key: &IndexMap<String, String>,
    scheme: MarkingScheme,
    intensity_values: &BTreeMap<String, Vec<f32>>,
) -> EvaluationResult {
    let mut score = 0.0;
    let mut rows: Vec<(usize, BubbleResult)> = Vec::with_capacity(answer_key.len());

    for (insertion_index, (question, expected)) in answer_key.iter().enumerate() {
        let marked = detected.get(question).cloned().unwrap_or_default();
        let is_correct: Correctness = if marked.is_empty() {
            score += scheme.unmarked;
            None
        } else if marked.eq_ignore_ascii_case(expected) {
            score += scheme.correct;
            Some(true)
        } else {
            score += scheme.incorrect;
            Some(false)
        };

        rows.push((
            insertion_index,
            BubbleResult {
                question: question.clone(),
                marked,
                correct: expected.clone(),
                is_correct,
                intensity_values: intensity_values.get(question).cloned().unwrap_or_default(),
            },
        ));
    }

    rows.sort_by_key(|(insertion_index, row)| (trailing_integer(&row.question), *insertion_index));
    let bubble_details: Vec<BubbleResult> = rows.into_iter().map(|(_, row)| row).collect();

    let total = answer_key.len();
    let percentage = if total > 0 {
        Some(((score / total as f64) * 100.0 * 100.0).round() / 100.0)
    } else {
        None
    };

    EvaluationResult { score, total, percentage, bubble_details }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|&(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn key_map(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs.iter().map(|&(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn scores_with_negative_marking_and_rounds_percentage() {
        let key = key_map(&[("q1", "A"), ("q2", "B"), ("q3", "C")]);
        let detected = map(&[("q1", "A"), ("q2", "X"), ("q3", "")]);
        let scheme = MarkingScheme { correct: 1.0, incorrect: -0.25, unmarked: 0.0 };
        let result = evaluate(&detected, &key, scheme, &BTreeMap::new());
        assert!((result.score - 0.75).abs() < 1e-9);
        assert_eq!(result.total, 3);
        assert_eq!(result.percentage, Some(25.0));
        let states: Vec<Correctness> = result.bubble_details.iter().map(|r| r.is_correct).collect();
        assert_eq!(states, vec![Some(true), Some(false), None]);
    }

    #[test]
    fn empty_answer_key_has_no_total_or_percentage() {
        let result = evaluate(&BTreeMap::new(), &IndexMap::new(), MarkingScheme::default(), &BTreeMap::new());
        assert_eq!(result.total, 0);
        assert_eq!(result.percentage, None);
        assert!(result.bubble_details.is_empty());
    }

    #[test]
    fn rows_sort_by_trailing_integer_not_lexical_order() {
        let key = key_map(&[("q2", "A"), ("q10", "A"), ("q1", "A")]);
        let detected = map(&[("q2", "A"), ("q10", "A"), ("q1", "A")]);
        let result = evaluate(&detected, &key, MarkingScheme::default(), &BTreeMap::new());
        let order: Vec<&str> = result.bubble_details.iter().map(|r| r.question.as_str()).collect();
        assert_eq!(order, vec!["q1", "q2", "q10"]);
    }

    #[test]
    fn comparison_is_case_insensitive() {
        let key = key_map(&[("q1", "a")]);
        let detected = map(&[("q1", "A")]);
        let result = evaluate(&detected, &key, MarkingScheme::default(), &BTreeMap::new());
        assert_eq!(result.bubble_details[0].is_correct, Some(true));
    }

    #[test]
    fn ties_preserve_answer_key_insertion_order_not_alphabetical() {
        // Both "qz" and "qa" have no trailing digits, so both sort as 0;
        // the insertion order in `key` must decide the tie, not the label text.
        let key = key_map(&[("qz", "A"), ("qa", "A")]);
        let detected = map(&[("qz", "A"), ("qa", "A")]);
        let result = evaluate(&detected, &key, MarkingScheme::default(), &BTreeMap::new());
        let order: Vec<&str> = result.bubble_details.iter().map(|r| r.question.as_str()).collect();
        assert_eq!(order, vec!["qz", "qa"]);
    }
}
