//! Point-to-point homography estimation: normalized DLT and a seeded RANSAC
//! wrapper around it.

use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::HomographyError;

/// Apply `h` to `(x, y)`. NaN when the point maps to infinity.
pub fn project(h: &Matrix3<f64>, x: f64, y: f64) -> [f64; 2] {
    let p = h * Vector3::new(x, y, 1.0);
    if p[2].abs() < 1e-15 {
        return [f64::NAN, f64::NAN];
    }
    [p[0] / p[2], p[1] / p[2]]
}

pub fn transfer_error(h: &Matrix3<f64>, src: [f64; 2], dst: [f64; 2]) -> f64 {
    let p = project(h, src[0], src[1]);
    (p[0] - dst[0]).hypot(p[1] - dst[1])
}

/// Similarity that moves the centroid to the origin and scales the mean
/// radius to sqrt(2). `None` for coincident points.
fn conditioner(pts: &[[f64; 2]]) -> Option<Matrix3<f64>> {
    let n = pts.len() as f64;
    let (sx, sy) = pts
        .iter()
        .fold((0.0, 0.0), |(ax, ay), p| (ax + p[0], ay + p[1]));
    let (cx, cy) = (sx / n, sy / n);
    let mean_r = pts
        .iter()
        .map(|p| (p[0] - cx).hypot(p[1] - cy))
        .sum::<f64>()
        / n;
    if !mean_r.is_finite() || mean_r < 1e-12 {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_r;
    Some(Matrix3::new(
        s, 0.0, -s * cx, //
        0.0, s, -s * cy, //
        0.0, 0.0, 1.0,
    ))
}

fn apply(t: &Matrix3<f64>, p: [f64; 2]) -> [f64; 2] {
    [
        t[(0, 0)] * p[0] + t[(0, 2)],
        t[(1, 1)] * p[1] + t[(1, 2)],
    ]
}

/// `true` when the points do not all lie on one line.
///
/// Measured on conditioned coordinates so the tolerance is scale free.
pub fn spans_plane(pts: &[[f64; 2]]) -> bool {
    let Some(t) = conditioner(pts) else {
        return false;
    };
    let q: Vec<[f64; 2]> = pts.iter().map(|&p| apply(&t, p)).collect();
    // second moment of the conditioned cloud; a line has one zero eigenvalue
    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    for p in &q {
        sxx += p[0] * p[0];
        sxy += p[0] * p[1];
        syy += p[1] * p[1];
    }
    let n = q.len() as f64;
    let det = (sxx * syy - sxy * sxy) / (n * n);
    det > 1e-6
}

/// Normalized DLT from at least four correspondences.
///
/// Returns `H` with `dst ≈ project(H, src)`, scaled so that `H[2][2] = 1`
/// whenever that entry is not vanishing.
pub fn estimate_dlt(src: &[[f64; 2]], dst: &[[f64; 2]]) -> Result<Matrix3<f64>, HomographyError> {
    if src.len() != dst.len() {
        return Err(HomographyError::LengthMismatch {
            src: src.len(),
            dst: dst.len(),
        });
    }
    let n = src.len();
    if n < 4 {
        return Err(HomographyError::TooFewPoints { needed: 4, got: n });
    }
    if !spans_plane(src) || !spans_plane(dst) {
        return Err(HomographyError::Degenerate);
    }
    let t_src = conditioner(src).ok_or(HomographyError::Degenerate)?;
    let t_dst = conditioner(dst).ok_or(HomographyError::Degenerate)?;

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (&s, &d)) in src.iter().zip(dst).enumerate() {
        let [x, y] = apply(&t_src, s);
        let [u, v] = apply(&t_dst, d);
        let r = 2 * i;
        a.row_mut(r)
            .copy_from_slice(&[0.0, 0.0, 0.0, -x, -y, -1.0, v * x, v * y, v]);
        a.row_mut(r + 1)
            .copy_from_slice(&[x, y, 1.0, 0.0, 0.0, 0.0, -u * x, -u * y, -u]);
    }

    // null vector of A = eigenvector of AᵀA with the smallest eigenvalue
    let eig = SymmetricEigen::new(a.transpose() * &a);
    let (best, _) = eig
        .eigenvalues
        .iter()
        .enumerate()
        .fold((0, f64::INFINITY), |acc, (i, &ev)| {
            if ev.abs() < acc.1 {
                (i, ev.abs())
            } else {
                acc
            }
        });
    let hv: Vec<f64> = eig.eigenvectors.column(best).iter().copied().collect();
    let hn = Matrix3::from_row_slice(&hv);

    let t_dst_inv = t_dst.try_inverse().ok_or(HomographyError::Degenerate)?;
    let h = t_dst_inv * hn * t_src;
    if h.iter().any(|v| !v.is_finite()) {
        return Err(HomographyError::Degenerate);
    }
    let w = h[(2, 2)];
    Ok(if w.abs() > 1e-15 { h / w } else { h })
}

/// RANSAC settings for homography fitting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RansacConfig {
    pub max_iters: usize,
    /// Inlier transfer-error threshold in destination units.
    pub inlier_threshold: f64,
    pub min_inliers: usize,
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            max_iters: 500,
            inlier_threshold: 2.0,
            min_inliers: 4,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RansacFit {
    pub h: Matrix3<f64>,
    pub inlier_mask: Vec<bool>,
    pub n_inliers: usize,
    /// Transfer error of every correspondence under the final `h`.
    pub errors: Vec<f64>,
}

/// Robust fit: best 4-point hypothesis by inlier count, then a DLT refit on
/// the consensus set.
pub fn fit_ransac(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
    cfg: &RansacConfig,
) -> Result<RansacFit, HomographyError> {
    if src.len() != dst.len() {
        return Err(HomographyError::LengthMismatch {
            src: src.len(),
            dst: dst.len(),
        });
    }
    let n = src.len();
    if n < 4 {
        return Err(HomographyError::TooFewPoints { needed: 4, got: n });
    }

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut best: Option<(Matrix3<f64>, usize)> = None;

    // a single minimal set has nothing to vote against
    let iters = if n == 4 { 1 } else { cfg.max_iters.max(1) };
    for _ in 0..iters {
        let pick = rand::seq::index::sample(&mut rng, n, 4);
        let s4: Vec<[f64; 2]> = pick.iter().map(|i| src[i]).collect();
        let d4: Vec<[f64; 2]> = pick.iter().map(|i| dst[i]).collect();
        let Ok(h) = estimate_dlt(&s4, &d4) else {
            continue;
        };
        let count = src
            .iter()
            .zip(dst)
            .filter(|&(&s, &d)| transfer_error(&h, s, d) < cfg.inlier_threshold)
            .count();
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((h, count));
            if count * 10 > n * 9 {
                break;
            }
        }
    }

    let (hyp, count) = best.ok_or(HomographyError::Degenerate)?;
    if count < cfg.min_inliers.max(4) {
        return Err(HomographyError::InsufficientInliers {
            needed: cfg.min_inliers.max(4),
            found: count,
        });
    }

    let (in_src, in_dst): (Vec<[f64; 2]>, Vec<[f64; 2]>) = src
        .iter()
        .zip(dst)
        .filter(|&(&s, &d)| transfer_error(&hyp, s, d) < cfg.inlier_threshold)
        .map(|(&s, &d)| (s, d))
        .unzip();
    let h = estimate_dlt(&in_src, &in_dst).unwrap_or(hyp);

    let errors: Vec<f64> = src
        .iter()
        .zip(dst)
        .map(|(&s, &d)| transfer_error(&h, s, d))
        .collect();
    let inlier_mask: Vec<bool> = errors.iter().map(|&e| e < cfg.inlier_threshold).collect();
    let n_inliers = inlier_mask.iter().filter(|&&m| m).count();
    Ok(RansacFit {
        h,
        inlier_mask,
        n_inliers,
        errors,
    })
}
