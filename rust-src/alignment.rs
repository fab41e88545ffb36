// alignment.rs - corner ordering and perspective-warp geometry for Section 4.B

use geo::{Area, EuclideanLength, LineString, Polygon};
use image::{GrayImage, Luma};
use imageproc::geometric_transformations::{warp, Interpolation, Projection};
use nalgebra::Point2;

/// A destination-ordered set of four corner points: top-left, top-right,
/// bottom-right, bottom-left.
#[derive(Debug, Clone, Copy)]
pub struct Quad {
    pub tl: (f64, f64),
    pub tr: (f64, f64),
    pub br: (f64, f64),
    pub bl: (f64, f64),
}

/// Order four arbitrary points into (TL, TR, BR, BL) using the classic
/// sum/diff rule: the TL point has the smallest `x+y`, BR the largest
/// `x+y`; TR has the smallest `y-x`, BL the largest `y-x`.
pub fn order_corners(pts: [(f64, f64); 4]) -> Quad {
    let points: Vec<Point2<f64>> = pts.iter().map(|&(x, y)| Point2::new(x, y)).collect();

    let tl = *points
        .iter()
        .min_by(|a, b| (a.x + a.y).partial_cmp(&(b.x + b.y)).unwrap())
        .unwrap();
    let br = *points
        .iter()
        .max_by(|a, b| (a.x + a.y).partial_cmp(&(b.x + b.y)).unwrap())
        .unwrap();
    let tr = *points
        .iter()
        .min_by(|a, b| (a.y - a.x).partial_cmp(&(b.y - b.x)).unwrap())
        .unwrap();
    let bl = *points
        .iter()
        .max_by(|a, b| (a.y - a.x).partial_cmp(&(b.y - b.x)).unwrap())
        .unwrap();

    Quad {
        tl: (tl.x, tl.y),
        tr: (tr.x, tr.y),
        br: (br.x, br.y),
        bl: (bl.x, bl.y),
    }
}

fn dist(a: (f64, f64), b: (f64, f64)) -> f64 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Perspective-warp `img` so the quadrilateral `quad` becomes an
/// axis-aligned rectangle of `max_width x max_height` (the longest pair of
/// opposing edges, per Section 4.B's common post-match step). Returns
/// `None` if the resulting rectangle is degenerate relative to the source
/// image (the caller rejects the pass in that case).
pub fn warp_quad_to_rect(img: &GrayImage, quad: &Quad, min_fraction: f64) -> Option<GrayImage> {
    let (src_w, src_h) = img.dimensions();

    let width_top = dist(quad.tl, quad.tr);
    let width_bottom = dist(quad.bl, quad.br);
    let max_width = width_top.max(width_bottom).round().max(1.0) as u32;

    let height_left = dist(quad.tl, quad.bl);
    let height_right = dist(quad.tr, quad.br);
    let max_height = height_left.max(height_right).round().max(1.0) as u32;

    if (max_width as f64) < src_w as f64 * min_fraction || (max_height as f64) < src_h as f64 * min_fraction {
        return None;
    }

    let from = [
        (quad.tl.0 as f32, quad.tl.1 as f32),
        (quad.tr.0 as f32, quad.tr.1 as f32),
        (quad.br.0 as f32, quad.br.1 as f32),
        (quad.bl.0 as f32, quad.bl.1 as f32),
    ];
    let to = [
        (0.0, 0.0),
        ((max_width - 1) as f32, 0.0),
        ((max_width - 1) as f32, (max_height - 1) as f32),
        (0.0, (max_height - 1) as f32),
    ];

    let projection = Projection::from_control_points(from, to)?;
    let warped = warp(
        img,
        &projection,
        Interpolation::Bilinear,
        Luma([255u8]),
    );

    let cropped = image::imageops::crop_imm(&warped, 0, 0, max_width, max_height).to_image();
    Some(cropped)
}

/// Area, convex-hull area and perimeter of a closed pixel contour, used by
/// the Pass 1 marker-contour and page-crop-fallback acceptance checks.
#[derive(Debug, Clone, Copy)]
pub struct PolygonMetrics {
    pub area: f64,
    pub hull_area: f64,
    pub perimeter: f64,
    pub bbox: (f64, f64, f64, f64), // min_x, min_y, max_x, max_y
}

impl PolygonMetrics {
    pub fn solidity(&self) -> f64 {
        if self.hull_area <= 0.0 {
            0.0
        } else {
            self.area / self.hull_area
        }
    }

    pub fn aspect_ratio(&self) -> f64 {
        let w = self.bbox.2 - self.bbox.0;
        let h = self.bbox.3 - self.bbox.1;
        if h <= 0.0 {
            0.0
        } else {
            w / h
        }
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.bbox.0 + self.bbox.2) / 2.0, (self.bbox.1 + self.bbox.3) / 2.0)
    }
}

fn closed_line_string(points: &[(f64, f64)]) -> LineString<f64> {
    let mut coords: Vec<(f64, f64)> = points.to_vec();
    if coords.first() != coords.last() {
        coords.push(coords[0]);
    }
    LineString::from(coords)
}

/// Convex hull via Andrew's monotone chain algorithm, sorted by `(x, y)`.
fn convex_hull(points: &[(f64, f64)]) -> Vec<(f64, f64)> {
    let mut pts = points.to_vec();
    pts.sort_by(|a, b| a.partial_cmp(b).unwrap());
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }

    fn cross(o: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
        (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
    }

    let mut lower: Vec<(f64, f64)> = Vec::new();
    for &p in &pts {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(p);
    }
    let mut upper: Vec<(f64, f64)> = Vec::new();
    for &p in pts.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(p);
    }
    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

fn shoelace_area(points: &[(f64, f64)]) -> f64 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..points.len() {
        let (x0, y0) = points[i];
        let (x1, y1) = points[(i + 1) % points.len()];
        sum += x0 * y1 - x1 * y0;
    }
    (sum / 2.0).abs()
}

pub fn polygon_metrics(points: &[(f64, f64)]) -> Option<PolygonMetrics> {
    if points.len() < 3 {
        return None;
    }
    let ring = closed_line_string(points);
    let polygon = Polygon::new(ring.clone(), vec![]);
    let area = polygon.unsigned_area();

    let hull = convex_hull(points);
    let hull_area = shoelace_area(&hull);

    let perimeter = ring.euclidean_length();

    let min_x = points.iter().map(|p| p.0).fold(f64::MAX, f64::min);
    let max_x = points.iter().map(|p| p.0).fold(f64::MIN, f64::max);
    let min_y = points.iter().map(|p| p.1).fold(f64::MAX, f64::min);
    let max_y = points.iter().map(|p| p.1).fold(f64::MIN, f64::max);

    Some(PolygonMetrics {
        area,
        hull_area,
        perimeter,
        bbox: (min_x, min_y, max_x, max_y),
    })
}

fn point_segment_distance(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let (dx, dy) = (b.0 - a.0, b.1 - a.1);
    let len_sq = dx * dx + dy * dy;
    if len_sq <= 1e-12 {
        return dist(p, a);
    }
    let t = (((p.0 - a.0) * dx + (p.1 - a.1) * dy) / len_sq).clamp(0.0, 1.0);
    dist(p, (a.0 + t * dx, a.1 + t * dy))
}

/// Douglas-Peucker simplification of an open point chain.
fn douglas_peucker(points: &[(f64, f64)], epsilon: f64) -> Vec<(f64, f64)> {
    if points.len() < 3 {
        return points.to_vec();
    }
    let (first, last) = (points[0], points[points.len() - 1]);
    let (mut split_idx, mut max_dist) = (0usize, 0.0f64);
    for (i, &p) in points.iter().enumerate().take(points.len() - 1).skip(1) {
        let d = point_segment_distance(p, first, last);
        if d > max_dist {
            max_dist = d;
            split_idx = i;
        }
    }
    if max_dist > epsilon {
        let mut left = douglas_peucker(&points[..=split_idx], epsilon);
        let right = douglas_peucker(&points[split_idx..], epsilon);
        left.pop();
        left.extend(right);
        left
    } else {
        vec![first, last]
    }
}

/// Closed-polygon approximation with `epsilon` expressed as a fraction of
/// the contour's own perimeter (Section 4.B Pass 1 step 4: "ε = 5% of
/// perimeter").
pub fn approx_polygon(points: &[(f64, f64)], epsilon_ratio: f64) -> Vec<(f64, f64)> {
    let ring = closed_line_string(points);
    let perimeter = ring.euclidean_length();
    let epsilon = (perimeter * epsilon_ratio).max(1e-6);

    let mut chain = points.to_vec();
    chain.push(points[0]);
    let mut simplified = douglas_peucker(&chain, epsilon);
    if simplified.len() > 1 && simplified.first() == simplified.last() {
        simplified.pop();
    }
    simplified
}

/// Distance from `point` to `corner`, normalised by the quadrant's own
/// diagonal (Section 4.B Pass 1 step 5's contour-selection score).
pub fn normalized_corner_distance(point: (f64, f64), corner: (f64, f64), quadrant_diagonal: f64) -> f64 {
    if quadrant_diagonal <= 0.0 {
        return 0.0;
    }
    dist(point, corner) / quadrant_diagonal
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_arbitrary_points_into_tl_tr_br_bl() {
        let pts = [(100.0, 0.0), (0.0, 0.0), (100.0, 100.0), (0.0, 100.0)];
        let quad = order_corners(pts);
        assert_eq!(quad.tl, (0.0, 0.0));
        assert_eq!(quad.tr, (100.0, 0.0));
        assert_eq!(quad.br, (100.0, 100.0));
        assert_eq!(quad.bl, (0.0, 100.0));
    }

    #[test]
    fn square_polygon_metrics_are_exact() {
        let square = [(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)];
        let metrics = polygon_metrics(&square).unwrap();
        assert!((metrics.area - 100.0).abs() < 1e-6);
        assert!((metrics.solidity() - 1.0).abs() < 1e-6);
        assert!((metrics.aspect_ratio() - 1.0).abs() < 1e-6);
    }
}
