//! Median smoothing of per-frame nearest detections.

use serde::{Deserialize, Serialize};

use crate::projection::WorldDetection;

/// One stabilized detection, ready to be offered to the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmoothedDetection {
    pub x_mm: f64,
    pub y_mm: f64,
    pub theta_deg: f64,
    pub class_id: u32,
}

/// Collects `window` consecutive detections and emits their component-wise
/// median, then starts over with an empty window.
///
/// Frames without a detection leave the window untouched.
#[derive(Debug, Clone)]
pub struct DetectionSmoother {
    window: usize,
    samples: Vec<WorldDetection>,
}

impl DetectionSmoother {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: Vec::with_capacity(window),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn pending(&self) -> usize {
        self.samples.len()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    pub fn push(&mut self, detection: WorldDetection) -> Option<SmoothedDetection> {
        self.samples.push(detection);
        if self.samples.len() < self.window {
            return None;
        }
        let pick = |f: fn(&WorldDetection) -> f64| {
            let mut v: Vec<f64> = self.samples.iter().map(f).collect();
            median(&mut v)
        };
        let out = SmoothedDetection {
            x_mm: pick(|d| d.x_mm),
            y_mm: pick(|d| d.y_mm),
            theta_deg: pick(|d| d.theta_deg),
            class_id: self.samples[self.samples.len() - 1].class_id,
        };
        self.samples.clear();
        Some(out)
    }
}

/// Median of a non-empty slice; the two middle values are averaged for even
/// lengths.
fn median(v: &mut [f64]) -> f64 {
    v.sort_by(|a, b| a.total_cmp(b));
    let n = v.len();
    if n % 2 == 1 {
        v[n / 2]
    } else {
        0.5 * (v[n / 2 - 1] + v[n / 2])
    }
}
