//! Pixel candidates to tray-frame detections.

use serde::{Deserialize, Serialize};

use crate::candidates::{ObjectCandidate, OrientedRect};
use crate::homography::Homography;

/// One object on the tray plane, in millimeters and degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldDetection {
    pub x_mm: f64,
    pub y_mm: f64,
    /// Long-axis angle in `[0, 180)`. `0.0` also stands in for "unknown",
    /// see `orientation_known`.
    pub theta_deg: f64,
    pub class_id: u32,
    pub orientation_known: bool,
}

impl WorldDetection {
    /// Whole-millimeter / whole-degree copy, truncated toward zero.
    pub fn truncated(&self) -> Self {
        Self {
            x_mm: self.x_mm.trunc(),
            y_mm: self.y_mm.trunc(),
            theta_deg: self.theta_deg.trunc(),
            ..*self
        }
    }

    pub fn distance_to(&self, p: [f64; 2]) -> f64 {
        (self.x_mm - p[0]).hypot(self.y_mm - p[1])
    }
}

fn wrap_180(deg: f64) -> f64 {
    let a = deg.rem_euclid(180.0);
    // rem_euclid can round up to the modulus for tiny negative inputs
    if a >= 180.0 {
        0.0
    } else {
        a
    }
}

/// World-frame angle of the rectangle's long axis, in `[0, 180)`.
///
/// Both long edges are mapped through `h` and summed so the result does not
/// depend on which corner the rectangle lists first. Without a homography
/// the angle is `0.0`.
pub fn angle_from_rectangle(rect: &OrientedRect, h: Option<&Homography>) -> f64 {
    let Some(h) = h else {
        return 0.0;
    };
    let mut world = [[0.0; 2]; 4];
    for (w, c) in world.iter_mut().zip(rect.corners.iter()) {
        match h.apply(*c) {
            Some(p) => *w = p,
            None => return 0.0,
        }
    }

    let axis_angle = |i: usize| {
        let (p0, p1, p2, p3) = (world[i], world[i + 1], world[(i + 2) % 4], world[(i + 3) % 4]);
        let dx = (p1[0] - p0[0]) + (p2[0] - p3[0]);
        let dy = (p1[1] - p0[1]) + (p2[1] - p3[1]);
        wrap_180(dy.atan2(dx).to_degrees())
    };

    let pair = |i: usize| rect.edge_length(i) + rect.edge_length(i + 2);
    let (even, odd) = (pair(0), pair(1));
    let scale = even.max(odd).max(f64::MIN_POSITIVE);
    if (even - odd).abs() <= 1e-9 * scale {
        // square: either axis is as good, pick one independent of labeling
        axis_angle(0).min(axis_angle(1))
    } else if even > odd {
        axis_angle(0)
    } else {
        axis_angle(1)
    }
}

/// Project one candidate. `None` when the frame has no homography or the
/// centroid maps to infinity.
pub fn project(candidate: &ObjectCandidate, h: Option<&Homography>) -> Option<WorldDetection> {
    let h = h?;
    let [x_mm, y_mm] = h.apply(candidate.centroid)?;
    let (theta_deg, orientation_known) = match &candidate.rect {
        Some(rect) => (angle_from_rectangle(rect, Some(h)), true),
        None => (0.0, false),
    };
    Some(WorldDetection {
        x_mm,
        y_mm,
        theta_deg,
        class_id: candidate.class_id,
        orientation_known,
    })
}

pub fn project_all(candidates: &[ObjectCandidate], h: Option<&Homography>) -> Vec<WorldDetection> {
    candidates.iter().filter_map(|c| project(c, h)).collect()
}

/// Detection closest to `reference`, truncated to whole units.
pub fn nearest_to(detections: &[WorldDetection], reference: [f64; 2]) -> Option<WorldDetection> {
    detections
        .iter()
        .min_by(|a, b| a.distance_to(reference).total_cmp(&b.distance_to(reference)))
        .map(WorldDetection::truncated)
}
