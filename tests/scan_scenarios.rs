// End-to-end scans over synthetic sheets, exercising the full
// decode -> rectify -> detect -> evaluate chain without a real scanned image.

use std::collections::BTreeMap;
use std::io::Cursor;

use bubblesheet_omr::{ImageInput, MarkingScheme, RectificationOutcome};
use image::{GrayImage, ImageOutputFormat, Luma};
use imageproc::drawing::draw_filled_circle_mut;
use indexmap::IndexMap;

const PAGE_W: u32 = 1700;
const PAGE_H: u32 = 2600;

/// Center of a default-template bubble's 42x42 box, given its top-left
/// corner as computed by the grid-generation formulas in template.rs.
fn bubble_center(origin_x: i64, origin_y: i64, question_index: i64, choice_index: i64) -> (i32, i32) {
    let x = origin_x + choice_index * 57;
    let y = origin_y + (question_index as f64 * 75.6).round() as i64;
    ((x + 21) as i32, (y + 21) as i32)
}

fn sheet_png(marks: &[(i32, i32)]) -> Vec<u8> {
    let mut img = GrayImage::from_pixel(PAGE_W, PAGE_H, Luma([255u8]));
    for &(cx, cy) in marks {
        draw_filled_circle_mut(&mut img, (cx, cy), 13, Luma([0u8]));
    }
    let mut bytes = Vec::new();
    image::DynamicImage::ImageLuma8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
        .unwrap();
    bytes
}

#[test]
fn strong_marks_on_three_columns_are_detected_at_the_right_choices() {
    // Column1_Q1_25 origin (90, 680): q1 = question index 0, choice A = 0.
    let q1_a = bubble_center(90, 680, 0, 0);
    // Column2_Q26_50 origin (530, 680): q50 is the 25th label (index 24), choice C = 2.
    let q50_c = bubble_center(530, 680, 24, 2);
    // Column4_Q76_100 origin (1410, 680): q100 is the 25th label (index 24), choice E = 4.
    let q100_e = bubble_center(1410, 680, 24, 4);

    let png = sheet_png(&[q1_a, q50_c, q100_e]);
    let result = bubblesheet_omr::process_omr_image(ImageInput::Bytes(&png), None, None, None, None).unwrap();

    assert_eq!(result.detected_answers.get("q1").map(String::as_str), Some("A"));
    assert_eq!(result.detected_answers.get("q50").map(String::as_str), Some("C"));
    assert_eq!(result.detected_answers.get("q100").map(String::as_str), Some("E"));
    assert_eq!(result.unmarked_count, 97);
    assert_eq!(result.multi_marked_count, 0);
}

#[test]
fn marked_sheet_scored_against_an_answer_key() {
    let q1_a = bubble_center(90, 680, 0, 0);
    let q50_c = bubble_center(530, 680, 24, 2);
    let q100_e = bubble_center(1410, 680, 24, 4);
    let png = sheet_png(&[q1_a, q50_c, q100_e]);

    let mut answer_key = IndexMap::new();
    answer_key.insert("q1".to_string(), "A".to_string());
    answer_key.insert("q50".to_string(), "D".to_string());
    answer_key.insert("q100".to_string(), "E".to_string());

    let scheme = MarkingScheme { correct: 1.0, incorrect: -0.25, unmarked: 0.0 };
    let result = bubblesheet_omr::process_omr_image(
        ImageInput::Bytes(&png),
        None,
        Some(&answer_key),
        Some(scheme),
        None,
    )
    .unwrap();

    assert_eq!(result.total, Some(3));
    assert!((result.score.unwrap() - 1.75).abs() < 1e-9);
    assert_eq!(result.percentage, Some(58.33));

    let by_question: BTreeMap<&str, &bubblesheet_omr::BubbleResult> =
        result.bubble_details.iter().map(|b| (b.question.as_str(), b)).collect();
    assert_eq!(by_question["q1"].is_correct, Some(true));
    assert_eq!(by_question["q50"].is_correct, Some(false));
    assert_eq!(by_question["q100"].is_correct, Some(true));
}

#[test]
fn sheet_with_no_markers_falls_back_to_unrectified_pass_through() {
    let png = sheet_png(&[]);
    let result = bubblesheet_omr::process_omr_image(ImageInput::Bytes(&png), None, None, None, None).unwrap();

    assert_eq!(result.rectification_outcome, RectificationOutcome::Unrectified);
    assert!(result.rectification_outcome.is_degraded());
    assert_eq!(result.unmarked_count, 100);
}
