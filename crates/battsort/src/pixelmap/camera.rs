use nalgebra::Matrix3;
use serde::{Deserialize, Serialize};

use super::PixelMapper;

/// Pinhole intrinsics taken from a 3x3 camera matrix `K`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CameraIntrinsics {
    /// Focal length in x (pixels).
    pub fx: f64,
    /// Focal length in y (pixels).
    pub fy: f64,
    /// Principal point x (pixels).
    pub cx: f64,
    /// Principal point y (pixels).
    pub cy: f64,
    /// Axis skew, zero for almost every real lens.
    #[serde(default)]
    pub skew: f64,
}

impl CameraIntrinsics {
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            skew: 0.0,
        }
    }

    /// Read intrinsics from a row-major camera matrix.
    ///
    /// Returns `None` when the bottom row is not `[0, 0, 1]` (up to scale) or
    /// the focal lengths are degenerate.
    pub fn from_matrix(k: &Matrix3<f64>) -> Option<Self> {
        let w = k[(2, 2)];
        if !w.is_finite() || w.abs() < 1e-12 || k[(2, 0)].abs() > 1e-9 || k[(2, 1)].abs() > 1e-9
        {
            return None;
        }
        let out = Self {
            fx: k[(0, 0)] / w,
            fy: k[(1, 1)] / w,
            cx: k[(0, 2)] / w,
            cy: k[(1, 2)] / w,
            skew: k[(0, 1)] / w,
        };
        out.is_valid().then_some(out)
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            self.fx, self.skew, self.cx, //
            0.0, self.fy, self.cy, //
            0.0, 0.0, 1.0,
        )
    }

    /// Focal lengths finite and non-zero, principal point finite.
    pub fn is_valid(&self) -> bool {
        [self.fx, self.fy, self.cx, self.cy, self.skew]
            .iter()
            .all(|v| v.is_finite())
            && self.fx.abs() > 1e-12
            && self.fy.abs() > 1e-12
    }

    pub fn pixel_to_normalized(&self, pixel: [f64; 2]) -> Option<[f64; 2]> {
        if !self.is_valid() {
            return None;
        }
        let y = (pixel[1] - self.cy) / self.fy;
        let x = (pixel[0] - self.cx - self.skew * y) / self.fx;
        (x.is_finite() && y.is_finite()).then_some([x, y])
    }

    pub fn normalized_to_pixel(&self, normalized: [f64; 2]) -> [f64; 2] {
        [
            self.fx * normalized[0] + self.skew * normalized[1] + self.cx,
            self.fy * normalized[1] + self.cy,
        ]
    }
}

/// Brown-Conrady lens distortion in the `(k1, k2, p1, p2, k3)` order used by
/// calibration archives.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct RadialTangentialDistortion {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    #[serde(default)]
    pub k3: f64,
}

impl RadialTangentialDistortion {
    /// Build from a flat coefficient list of length 4 or 5.
    pub fn from_coefficients(d: &[f64]) -> Option<Self> {
        match d {
            [k1, k2, p1, p2] => Some(Self {
                k1: *k1,
                k2: *k2,
                p1: *p1,
                p2: *p2,
                k3: 0.0,
            }),
            [k1, k2, p1, p2, k3] => Some(Self {
                k1: *k1,
                k2: *k2,
                p1: *p1,
                p2: *p2,
                k3: *k3,
            }),
            _ => None,
        }
        .filter(|dist| dist.coefficients().iter().all(|c| c.is_finite()))
    }

    pub fn coefficients(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    fn radial(&self, r2: f64) -> f64 {
        1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3))
    }

    fn tangential(&self, x: f64, y: f64, r2: f64) -> [f64; 2] {
        [
            2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x),
            self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y,
        ]
    }

    /// Ideal normalized coordinates to distorted normalized coordinates.
    pub fn distort(&self, ideal: [f64; 2]) -> [f64; 2] {
        let [x, y] = ideal;
        let r2 = x * x + y * y;
        let radial = self.radial(r2);
        let [tx, ty] = self.tangential(x, y, r2);
        [x * radial + tx, y * radial + ty]
    }

    /// Fixed-point inversion of [`distort`](Self::distort).
    pub fn undistort(&self, distorted: [f64; 2], cfg: UndistortConfig) -> Option<[f64; 2]> {
        let mut p = distorted;
        for _ in 0..cfg.max_iters.max(1) {
            let r2 = p[0] * p[0] + p[1] * p[1];
            let radial = self.radial(r2);
            if !radial.is_finite() || radial.abs() < 1e-12 {
                return None;
            }
            let [tx, ty] = self.tangential(p[0], p[1], r2);
            let next = [(distorted[0] - tx) / radial, (distorted[1] - ty) / radial];
            if !next[0].is_finite() || !next[1].is_finite() {
                return None;
            }
            let step = (next[0] - p[0]).hypot(next[1] - p[1]);
            p = next;
            if step <= cfg.eps.max(0.0) {
                break;
            }
        }
        Some(p)
    }
}

/// Iterative undistortion settings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct UndistortConfig {
    pub max_iters: usize,
    /// Convergence threshold on the normalized-coordinate update.
    pub eps: f64,
}

impl Default for UndistortConfig {
    fn default() -> Self {
        Self {
            max_iters: 20,
            eps: 1e-12,
        }
    }
}

/// Calibrated lens: intrinsics plus distortion.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CameraModel {
    pub intrinsics: CameraIntrinsics,
    pub distortion: RadialTangentialDistortion,
}

impl CameraModel {
    pub fn new(intrinsics: CameraIntrinsics, distortion: RadialTangentialDistortion) -> Self {
        Self {
            intrinsics,
            distortion,
        }
    }

    /// Ideal (undistorted) pixel to the pixel the lens actually records.
    pub fn distort_pixel(&self, ideal: [f64; 2]) -> Option<[f64; 2]> {
        let n = self.intrinsics.pixel_to_normalized(ideal)?;
        finite(self.intrinsics.normalized_to_pixel(self.distortion.distort(n)))
    }

    pub fn undistort_pixel(&self, distorted: [f64; 2]) -> Option<[f64; 2]> {
        let n = self.intrinsics.pixel_to_normalized(distorted)?;
        let ideal = self.distortion.undistort(n, UndistortConfig::default())?;
        finite(self.intrinsics.normalized_to_pixel(ideal))
    }

    /// Camera matrix for the undistorted view of an image of `size`.
    ///
    /// `alpha = 0` zooms so that every output pixel has a valid source pixel;
    /// `alpha = 1` keeps every source pixel inside the output at the cost of
    /// black borders. Values in between interpolate.
    pub fn optimal_new_intrinsics(&self, size: [u32; 2], alpha: f64) -> CameraIntrinsics {
        const GRID: usize = 9;
        let (w, h) = (size[0].max(2) as f64, size[1].max(2) as f64);
        let alpha = alpha.clamp(0.0, 1.0);

        let mut outer = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];
        let mut inner = [f64::NEG_INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::INFINITY];
        for row in 0..GRID {
            for col in 0..GRID {
                let px = [
                    col as f64 * (w - 1.0) / (GRID - 1) as f64,
                    row as f64 * (h - 1.0) / (GRID - 1) as f64,
                ];
                let Some(n) = self
                    .intrinsics
                    .pixel_to_normalized(px)
                    .and_then(|n| self.distortion.undistort(n, UndistortConfig::default()))
                else {
                    continue;
                };
                outer[0] = outer[0].min(n[0]);
                outer[1] = outer[1].min(n[1]);
                outer[2] = outer[2].max(n[0]);
                outer[3] = outer[3].max(n[1]);
                if col == 0 {
                    inner[0] = inner[0].max(n[0]);
                }
                if row == 0 {
                    inner[1] = inner[1].max(n[1]);
                }
                if col == GRID - 1 {
                    inner[2] = inner[2].min(n[0]);
                }
                if row == GRID - 1 {
                    inner[3] = inner[3].min(n[1]);
                }
            }
        }

        let fit = |r: [f64; 4]| -> Option<[f64; 4]> {
            let (rw, rh) = (r[2] - r[0], r[3] - r[1]);
            if !(rw.is_finite() && rh.is_finite()) || rw <= 1e-12 || rh <= 1e-12 {
                return None;
            }
            let fx = (w - 1.0) / rw;
            let fy = (h - 1.0) / rh;
            Some([fx, fy, -fx * r[0], -fy * r[1]])
        };
        let (Some(a), Some(b)) = (fit(inner), fit(outer)) else {
            return self.intrinsics;
        };
        let mix = |i: usize| a[i] * (1.0 - alpha) + b[i] * alpha;
        CameraIntrinsics::new(mix(0), mix(1), mix(2), mix(3))
    }
}

impl PixelMapper for CameraModel {
    fn distorted_to_ideal(&self, distorted: [f64; 2]) -> Option<[f64; 2]> {
        self.undistort_pixel(distorted)
    }

    fn ideal_to_distorted(&self, ideal: [f64; 2]) -> Option<[f64; 2]> {
        self.distort_pixel(ideal)
    }
}

/// A lens paired with a different output camera matrix, as produced by
/// [`CameraModel::optimal_new_intrinsics`]. Ideal pixels live in the output
/// matrix's frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RectifiedView {
    pub lens: CameraModel,
    pub output: CameraIntrinsics,
}

impl PixelMapper for RectifiedView {
    fn distorted_to_ideal(&self, distorted: [f64; 2]) -> Option<[f64; 2]> {
        let n = self.lens.intrinsics.pixel_to_normalized(distorted)?;
        let ideal = self.lens.distortion.undistort(n, UndistortConfig::default())?;
        finite(self.output.normalized_to_pixel(ideal))
    }

    fn ideal_to_distorted(&self, ideal: [f64; 2]) -> Option<[f64; 2]> {
        let n = self.output.pixel_to_normalized(ideal)?;
        finite(
            self.lens
                .intrinsics
                .normalized_to_pixel(self.lens.distortion.distort(n)),
        )
    }
}

fn finite(p: [f64; 2]) -> Option<[f64; 2]> {
    (p[0].is_finite() && p[1].is_finite()).then_some(p)
}
