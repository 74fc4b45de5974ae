//! Object candidates from the external detector's raw output.
//!
//! Mask outlines are rasterized, closed with a 3x3 structuring element and
//! reduced to the minimum-area rectangle of their outer contour. Box-only
//! detections keep just their center.

use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::drawing::draw_polygon_mut;
use imageproc::geometry::convex_hull;
use imageproc::morphology::close;
use imageproc::point::Point;
use serde::{Deserialize, Serialize};

/// Shape reported by the detector for one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DetectionShape {
    /// Segmentation outline in pixels.
    Polygon(Vec<[f64; 2]>),
    /// Axis-aligned box, `min` top-left, `max` bottom-right.
    Box { min: [f64; 2], max: [f64; 2] },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub shape: DetectionShape,
    pub class_id: u32,
    pub confidence: f32,
}

/// Black-box object detector. Returns every object at or above
/// `min_confidence`, preferring polygons when the model produces masks.
pub trait ObjectDetector: Send {
    fn detect(&mut self, frame: &RgbImage, min_confidence: f32) -> Vec<RawDetection>;
}

/// Rotated rectangle; consecutive corners share an edge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrientedRect {
    pub center: [f64; 2],
    pub corners: [[f64; 2]; 4],
}

impl OrientedRect {
    pub fn edge_length(&self, i: usize) -> f64 {
        let a = self.corners[i % 4];
        let b = self.corners[(i + 1) % 4];
        (b[0] - a[0]).hypot(b[1] - a[1])
    }
}

/// One object in one frame, in undistorted pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectCandidate {
    pub centroid: [f64; 2],
    /// `None` for box-only detections: orientation is unknown.
    pub rect: Option<OrientedRect>,
    pub class_id: u32,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct CandidateExtractor {
    guard_px: u32,
}

impl CandidateExtractor {
    pub fn new(guard_px: u32) -> Self {
        Self { guard_px }
    }

    /// `true` when any point falls inside the guard band along the frame
    /// border.
    fn touches_guard(&self, pts: &[[f64; 2]], size: [u32; 2]) -> bool {
        let g = self.guard_px as f64;
        let (w, h) = (size[0] as f64, size[1] as f64);
        pts.iter()
            .any(|p| p[0] < g || p[0] > w - g || p[1] < g || p[1] > h - g)
    }

    pub fn extract(&self, frame_size: [u32; 2], detections: &[RawDetection]) -> Vec<ObjectCandidate> {
        let mut out = Vec::with_capacity(detections.len());
        for det in detections {
            let candidate = match &det.shape {
                DetectionShape::Polygon(poly) => {
                    if self.touches_guard(poly, frame_size) {
                        tracing::trace!("class {} outline touches the guard band", det.class_id);
                        continue;
                    }
                    let Some(rect) = silhouette_rect(poly) else {
                        continue;
                    };
                    ObjectCandidate {
                        centroid: rect.center,
                        rect: Some(rect),
                        class_id: det.class_id,
                        confidence: det.confidence,
                    }
                }
                DetectionShape::Box { min, max } => {
                    if self.touches_guard(&[*min, *max], frame_size) {
                        continue;
                    }
                    ObjectCandidate {
                        centroid: [(min[0] + max[0]) / 2.0, (min[1] + max[1]) / 2.0],
                        rect: None,
                        class_id: det.class_id,
                        confidence: det.confidence,
                    }
                }
            };
            out.push(candidate);
        }
        out
    }
}

/// Fill, close, take the outer contour and fit its minimum-area rectangle.
///
/// The mask is cropped to the outline's bounding box (plus a margin for the
/// closing) and results are shifted back to frame pixels.
pub fn silhouette_rect(poly: &[[f64; 2]]) -> Option<OrientedRect> {
    const PAD: i32 = 2;
    let mut pts: Vec<Point<i32>> = Vec::with_capacity(poly.len());
    for p in poly {
        if !p[0].is_finite() || !p[1].is_finite() {
            return None;
        }
        let q = Point::new(p[0] as i32, p[1] as i32);
        if pts.last() != Some(&q) {
            pts.push(q);
        }
    }
    while pts.len() > 1 && pts.first() == pts.last() {
        pts.pop();
    }
    if pts.len() < 3 {
        return None;
    }

    let x0 = pts.iter().map(|p| p.x).min()? - PAD;
    let y0 = pts.iter().map(|p| p.y).min()? - PAD;
    let x1 = pts.iter().map(|p| p.x).max()? + PAD;
    let y1 = pts.iter().map(|p| p.y).max()? + PAD;
    let local: Vec<Point<i32>> = pts.iter().map(|p| Point::new(p.x - x0, p.y - y0)).collect();

    let mut mask = GrayImage::new((x1 - x0 + 1) as u32, (y1 - y0 + 1) as u32);
    draw_polygon_mut(&mut mask, &local, Luma([255u8]));
    let mask = close(&mask, Norm::LInf, 1);

    let outline = find_contours::<i32>(&mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .max_by_key(|c| c.points.len())?;
    let rect = min_area_rect(&outline.points)?;
    let shift = |p: [f64; 2]| [p[0] + x0 as f64, p[1] + y0 as f64];
    Some(OrientedRect {
        center: shift(rect.center),
        corners: rect.corners.map(shift),
    })
}

/// Rotating-calipers minimum-area rectangle over the convex hull.
///
/// `imageproc::geometry::min_area_rect` returns corners in the input's point
/// type, which is `Point<i32>` for contours. Corners here stay `f64` so the
/// center and long axis of a tilted outline keep their sub-pixel position.
pub fn min_area_rect(points: &[Point<i32>]) -> Option<OrientedRect> {
    let hull: Vec<[f64; 2]> = convex_hull(points)
        .iter()
        .map(|p| [p.x as f64, p.y as f64])
        .collect();
    if hull.len() < 3 {
        return None;
    }

    let mut best: Option<(f64, [f64; 2], [f64; 4])> = None;
    for i in 0..hull.len() {
        let a = hull[i];
        let b = hull[(i + 1) % hull.len()];
        let len = (b[0] - a[0]).hypot(b[1] - a[1]);
        if len < 1e-12 {
            continue;
        }
        let u = [(b[0] - a[0]) / len, (b[1] - a[1]) / len];
        let v = [-u[1], u[0]];
        let (mut umin, mut umax, mut vmin, mut vmax) =
            (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY);
        for p in &hull {
            let pu = p[0] * u[0] + p[1] * u[1];
            let pv = p[0] * v[0] + p[1] * v[1];
            umin = umin.min(pu);
            umax = umax.max(pu);
            vmin = vmin.min(pv);
            vmax = vmax.max(pv);
        }
        let area = (umax - umin) * (vmax - vmin);
        if best.map_or(true, |(a, _, _)| area < a) {
            best = Some((area, u, [umin, umax, vmin, vmax]));
        }
    }

    let (_, u, [umin, umax, vmin, vmax]) = best?;
    let v = [-u[1], u[0]];
    let at = |s: f64, t: f64| [s * u[0] + t * v[0], s * u[1] + t * v[1]];
    let corners = [at(umin, vmin), at(umax, vmin), at(umax, vmax), at(umin, vmax)];
    let center = at((umin + umax) / 2.0, (vmin + vmax) / 2.0);
    Some(OrientedRect { center, corners })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotated_outline(center: [f64; 2], half: [f64; 2], deg: f64) -> Vec<[f64; 2]> {
        let (s, c) = deg.to_radians().sin_cos();
        [[-1.0, -1.0], [1.0, -1.0], [1.0, 1.0], [-1.0, 1.0]]
            .iter()
            .map(|k| {
                let x = k[0] * half[0];
                let y = k[1] * half[1];
                [center[0] + c * x - s * y, center[1] + s * x + c * y]
            })
            .collect()
    }

    fn polygon(poly: Vec<[f64; 2]>) -> RawDetection {
        RawDetection {
            shape: DetectionShape::Polygon(poly),
            class_id: 1,
            confidence: 0.9,
        }
    }

    #[test]
    fn min_area_rect_of_axis_aligned_points() {
        let pts: Vec<Point<i32>> = [(0, 0), (10, 0), (10, 4), (0, 4), (5, 2)]
            .iter()
            .map(|&(x, y)| Point::new(x, y))
            .collect();
        let r = min_area_rect(&pts).unwrap();
        assert!((r.center[0] - 5.0).abs() < 1e-9 && (r.center[1] - 2.0).abs() < 1e-9);
        let long = r.edge_length(0).max(r.edge_length(1));
        let short = r.edge_length(0).min(r.edge_length(1));
        assert!((long - 10.0).abs() < 1e-9 && (short - 4.0).abs() < 1e-9);
    }

    #[test]
    fn tilted_rectangle_keeps_fractional_corners() {
        let pts: Vec<Point<i32>> = [(0, 0), (7, 1), (2, 5)]
            .iter()
            .map(|&(x, y)| Point::new(x, y))
            .collect();
        let r = min_area_rect(&pts).unwrap();
        assert!((r.edge_length(0) * r.edge_length(1) - 33.0).abs() < 1e-9);
        assert!(r
            .corners
            .iter()
            .flatten()
            .any(|v| (v - v.round()).abs() > 0.1));
    }

    #[test]
    fn collinear_points_have_no_rectangle() {
        let pts: Vec<Point<i32>> = (0..5).map(|i| Point::new(i, 2 * i)).collect();
        assert!(min_area_rect(&pts).is_none());
    }

    #[test]
    fn rotated_mask_keeps_center_and_long_axis() {
        let poly = rotated_outline([200.0, 150.0], [40.0, 12.0], 30.0);
        let rect = silhouette_rect(&poly).unwrap();
        assert!((rect.center[0] - 200.0).abs() < 2.0, "{:?}", rect.center);
        assert!((rect.center[1] - 150.0).abs() < 2.0, "{:?}", rect.center);
        let (i_long, _) = (0..2)
            .map(|i| (i, rect.edge_length(i)))
            .fold((0, 0.0), |acc, (i, l)| if l > acc.1 { (i, l) } else { acc });
        let a = rect.corners[i_long];
        let b = rect.corners[i_long + 1];
        let deg = (b[1] - a[1]).atan2(b[0] - a[0]).to_degrees().rem_euclid(180.0);
        assert!((deg - 30.0).abs() < 4.0, "long axis at {deg}");
    }

    #[test]
    fn guard_band_drops_partial_objects() {
        let ex = CandidateExtractor::new(10);
        let inside = polygon(rotated_outline([100.0, 100.0], [20.0, 8.0], 0.0));
        let clipped = polygon(rotated_outline([15.0, 100.0], [20.0, 8.0], 0.0));
        let out = ex.extract([640, 480], &[inside, clipped]);
        assert_eq!(out.len(), 1);
        assert!(out[0].rect.is_some());
        assert!((out[0].centroid[0] - 100.0).abs() < 2.0);
    }

    #[test]
    fn vertex_exactly_on_guard_line_is_kept() {
        let ex = CandidateExtractor::new(10);
        let det = RawDetection {
            shape: DetectionShape::Box {
                min: [10.0, 10.0],
                max: [630.0, 470.0],
            },
            class_id: 0,
            confidence: 0.5,
        };
        assert_eq!(ex.extract([640, 480], &[det]).len(), 1);
    }

    #[test]
    fn box_fallback_has_center_but_no_orientation() {
        let ex = CandidateExtractor::new(0);
        let det = RawDetection {
            shape: DetectionShape::Box {
                min: [100.0, 40.0],
                max: [140.0, 60.0],
            },
            class_id: 4,
            confidence: 0.7,
        };
        let out = ex.extract([640, 480], &[det]);
        assert_eq!(out[0].centroid, [120.0, 50.0]);
        assert!(out[0].rect.is_none());
        assert_eq!(out[0].class_id, 4);
    }
}
