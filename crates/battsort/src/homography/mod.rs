//! Pixel-to-world plane homographies.

mod estimate;

pub use estimate::{estimate_dlt, fit_ransac, project, spans_plane, transfer_error};
pub use estimate::{RansacConfig, RansacFit};

use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HomographyError {
    #[error("too few points: need {needed}, got {got}")]
    TooFewPoints { needed: usize, got: usize },
    #[error("source and destination lengths differ ({src} vs {dst})")]
    LengthMismatch { src: usize, dst: usize },
    #[error("correspondences are degenerate (coincident or collinear)")]
    Degenerate,
    #[error("insufficient inliers: need {needed}, found {found}")]
    InsufficientInliers { needed: usize, found: usize },
}

/// Projective map from undistorted image pixels to tray-plane millimeters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Homography {
    h: Matrix3<f64>,
}

impl Homography {
    pub fn from_matrix(h: Matrix3<f64>) -> Self {
        Self { h }
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.h
    }

    /// Row-major copy, for serialization.
    pub fn to_array(&self) -> [[f64; 3]; 3] {
        let h = &self.h;
        [
            [h[(0, 0)], h[(0, 1)], h[(0, 2)]],
            [h[(1, 0)], h[(1, 1)], h[(1, 2)]],
            [h[(2, 0)], h[(2, 1)], h[(2, 2)]],
        ]
    }

    /// Pixel to world millimeters. `None` on the line at infinity.
    pub fn apply(&self, pixel: [f64; 2]) -> Option<[f64; 2]> {
        let p = project(&self.h, pixel[0], pixel[1]);
        (p[0].is_finite() && p[1].is_finite()).then_some(p)
    }
}

/// Summary of a robust fit, in world millimeters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RansacStats {
    pub n_points: usize,
    pub n_inliers: usize,
    pub threshold: f64,
    pub mean_err: f64,
    pub p95_err: f64,
}

impl RansacStats {
    pub fn from_fit(fit: &RansacFit, threshold: f64) -> Self {
        let mut inlier_errs: Vec<f64> = fit
            .errors
            .iter()
            .zip(&fit.inlier_mask)
            .filter_map(|(&e, &m)| m.then_some(e))
            .collect();
        let (mean_err, p95_err) = mean_and_p95(&mut inlier_errs);
        Self {
            n_points: fit.errors.len(),
            n_inliers: fit.n_inliers,
            threshold,
            mean_err,
            p95_err,
        }
    }
}

fn mean_and_p95(errs: &mut [f64]) -> (f64, f64) {
    if errs.is_empty() {
        return (0.0, 0.0);
    }
    let mean = errs.iter().sum::<f64>() / errs.len() as f64;
    errs.sort_by(|a, b| a.total_cmp(b));
    let idx = ((errs.len() as f64 * 0.95).ceil() as usize).clamp(1, errs.len()) - 1;
    (mean, errs[idx])
}
