//! Offline checkerboard calibration.
//!
//! Views are accumulated one frame at a time; [`CalibrationSession::solve`]
//! then runs:
//!
//! 1. `H_k` from board millimeters to observed pixels for every view.
//! 2. `K` from the `H_k` (Zhang's constraints on the image of the absolute
//!    conic) and one board pose per view from `K^-1 H_k`.
//! 3. `(k1, k2, p1, p2)` by linear least squares on `observed - H_k board`,
//!    kept only if it beats zero distortion.
//! 4. Levenberg-Marquardt over camera and poses on every corner residual.

use nalgebra::{DMatrix, DVector, Matrix3, SymmetricEigen, Vector3};
use serde::{Deserialize, Serialize};

use super::refine::{self, BoardPose};
use super::{CalibrationError, CalibrationProfile};
use crate::homography::{estimate_dlt, project};
use crate::pixelmap::{CameraIntrinsics, CameraModel, RadialTangentialDistortion};

/// Inner-corner geometry of a printed checkerboard.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CheckerboardSpec {
    /// Inner corners per row.
    pub cols: usize,
    /// Inner corners per column.
    pub rows: usize,
    pub square_mm: f64,
}

impl Default for CheckerboardSpec {
    fn default() -> Self {
        Self {
            cols: 9,
            rows: 6,
            square_mm: 19.0,
        }
    }
}

impl CheckerboardSpec {
    pub fn corner_count(&self) -> usize {
        self.cols * self.rows
    }

    /// Board-plane corner positions in millimeters, row by row.
    pub fn object_points(&self) -> Vec<[f64; 2]> {
        (0..self.rows)
            .flat_map(|r| {
                (0..self.cols).map(move |c| [c as f64 * self.square_mm, r as f64 * self.square_mm])
            })
            .collect()
    }
}

/// Outcome of a successful solve.
#[derive(Debug, Clone)]
pub struct CalibrationReport {
    pub profile: CalibrationProfile,
    pub n_views: usize,
    /// RMS distance between observed corners and the reprojected board.
    pub rms_px: f64,
}

#[derive(Debug, Clone)]
pub struct CalibrationSession {
    board: CheckerboardSpec,
    image_size: [u32; 2],
    target_views: usize,
    max_iterations: usize,
    views: Vec<Vec<[f64; 2]>>,
}

impl CalibrationSession {
    pub fn new(board: CheckerboardSpec, image_size: [u32; 2]) -> Self {
        Self {
            board,
            image_size,
            target_views: 20,
            max_iterations: 100,
            views: Vec::new(),
        }
    }

    pub fn with_target_views(mut self, n: usize) -> Self {
        self.target_views = n.max(3);
        self
    }

    pub fn board(&self) -> &CheckerboardSpec {
        &self.board
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Enough views collected for the interactive capture loop to stop.
    pub fn is_complete(&self) -> bool {
        self.views.len() >= self.target_views
    }

    /// Add one frame's corners (ordered like [`CheckerboardSpec::object_points`]).
    /// Partial detections are refused.
    pub fn add_view(&mut self, corners: Vec<[f64; 2]>) -> Result<usize, CalibrationError> {
        if corners.len() != self.board.corner_count() {
            return Err(CalibrationError::IncompleteView {
                expected: self.board.corner_count(),
                got: corners.len(),
            });
        }
        if corners.iter().any(|p| !p[0].is_finite() || !p[1].is_finite()) {
            return Err(CalibrationError::Degenerate("non-finite corner".into()));
        }
        self.views.push(corners);
        tracing::debug!("calibration view {}/{}", self.views.len(), self.target_views);
        Ok(self.views.len())
    }

    pub fn solve(&self) -> Result<CalibrationReport, CalibrationError> {
        if self.views.len() < 3 {
            return Err(CalibrationError::NotEnoughViews {
                needed: 3,
                got: self.views.len(),
            });
        }
        let board = self.board.object_points();

        let homographies = self
            .views
            .iter()
            .map(|obs| estimate_dlt(&board, obs))
            .collect::<Result<Vec<_>, _>>()?;
        let zhang = intrinsics_from_homographies(&homographies)?;
        let intrinsics = CameraIntrinsics::new(zhang.fx, zhang.fy, zhang.cx, zhang.cy);
        let poses = homographies
            .iter()
            .map(|h| BoardPose::from_homography(&intrinsics, h))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| CalibrationError::Degenerate("board pose from homography".into()))?;

        let mut distortion = RadialTangentialDistortion::default();
        let mut seed_rms =
            refine::reprojection_rms(&intrinsics, &distortion, &poses, &board, &self.views);
        match fit_distortion(&intrinsics, &homographies, &board, &self.views) {
            Ok(fit) => {
                let rms =
                    refine::reprojection_rms(&intrinsics, &fit, &poses, &board, &self.views);
                if rms < seed_rms {
                    distortion = fit;
                    seed_rms = rms;
                }
            }
            Err(e) => tracing::debug!("linear distortion seed skipped: {e}"),
        }
        tracing::debug!(
            "seed: fx={:.2} fy={:.2} k1={:.4}, rms {:.3}px",
            intrinsics.fx,
            intrinsics.fy,
            distortion.k1,
            seed_rms
        );

        let refined = refine::refine(
            &board,
            &self.views,
            &intrinsics,
            &distortion,
            &poses,
            self.max_iterations,
        )
        .ok_or(CalibrationError::RefinementFailed)?;
        let (intrinsics, distortion) = (refined.intrinsics, refined.distortion);
        let rms_px = refine::reprojection_rms(
            &intrinsics,
            &distortion,
            &refined.poses,
            &board,
            &self.views,
        );
        if !rms_px.is_finite() {
            return Err(CalibrationError::RefinementFailed);
        }
        tracing::info!(
            "calibrated from {} views: fx={:.1} fy={:.1} cx={:.1} cy={:.1} k1={:.4} k2={:.4}, rms {:.3}px",
            self.views.len(),
            intrinsics.fx,
            intrinsics.fy,
            intrinsics.cx,
            intrinsics.cy,
            distortion.k1,
            distortion.k2,
            rms_px
        );
        Ok(CalibrationReport {
            profile: CalibrationProfile::new(
                CameraModel::new(intrinsics, distortion),
                self.image_size,
            ),
            n_views: self.views.len(),
            rms_px,
        })
    }
}

/// Zhang's `v_ij` row built from columns `i`, `j` of `h`.
fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> [f64; 6] {
    let (a, b) = (h.column(i), h.column(j));
    [
        a[0] * b[0],
        a[0] * b[1] + a[1] * b[0],
        a[1] * b[1],
        a[2] * b[0] + a[0] * b[2],
        a[2] * b[1] + a[1] * b[2],
        a[2] * b[2],
    ]
}

/// Closed-form `K` from at least three plane-to-image homographies.
pub fn intrinsics_from_homographies(
    hs: &[Matrix3<f64>],
) -> Result<CameraIntrinsics, CalibrationError> {
    if hs.len() < 3 {
        return Err(CalibrationError::NotEnoughViews {
            needed: 3,
            got: hs.len(),
        });
    }
    // work in pixels / s so that the entries of B are all of order one
    let s = hs
        .iter()
        .map(|h| {
            let o = project(h, 0.0, 0.0);
            o[0].hypot(o[1])
        })
        .filter(|d| d.is_finite() && *d > 1e-9)
        .sum::<f64>()
        / hs.len() as f64;
    let s = if s > 1e-9 { s } else { 1.0 };
    let t = Matrix3::new(1.0 / s, 0.0, 0.0, 0.0, 1.0 / s, 0.0, 0.0, 0.0, 1.0);

    let mut v = DMatrix::<f64>::zeros(2 * hs.len(), 6);
    for (k, h) in hs.iter().enumerate() {
        let h = t * h;
        let h = h / h.norm();
        let v12 = v_ij(&h, 0, 1);
        let v11 = v_ij(&h, 0, 0);
        let v22 = v_ij(&h, 1, 1);
        for c in 0..6 {
            v[(2 * k, c)] = v12[c];
            v[(2 * k + 1, c)] = v11[c] - v22[c];
        }
    }

    let eig = SymmetricEigen::new(v.transpose() * &v);
    let min_idx = eig
        .eigenvalues
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let mut b: Vec<f64> = eig.eigenvectors.column(min_idx).iter().copied().collect();
    if b[0] < 0.0 {
        b.iter_mut().for_each(|x| *x = -*x);
    }
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    if denom.abs() <= 1e-12 * (b11 * b11 + b22 * b22) || b11.abs() < 1e-18 {
        return Err(CalibrationError::Degenerate(
            "views do not constrain the image of the absolute conic".into(),
        ));
    }
    let cy = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + cy * (b12 * b13 - b11 * b23)) / b11;
    if lambda / b11 <= 0.0 || lambda * b11 / denom <= 0.0 {
        return Err(CalibrationError::Degenerate(
            "closed-form intrinsics have the wrong sign".into(),
        ));
    }
    let fx = (lambda / b11).sqrt();
    let fy = (lambda * b11 / denom).sqrt();
    let skew = -b12 * fx * fx * fy / lambda;
    let cx = skew * cy / fy - b13 * fx * fx / lambda;

    let k = CameraIntrinsics {
        fx: fx * s,
        fy: fy * s,
        cx: cx * s,
        cy: cy * s,
        skew: skew * s,
    };
    if k.is_valid() {
        Ok(k)
    } else {
        Err(CalibrationError::InvalidIntrinsics)
    }
}

/// Least-squares `(k1, k2, p1, p2)` explaining the gap between observed corners
/// and the ideal projections `H_k · board`. `k3` stays zero.
pub fn fit_distortion(
    k: &CameraIntrinsics,
    hs: &[Matrix3<f64>],
    board: &[[f64; 2]],
    views: &[Vec<[f64; 2]>],
) -> Result<RadialTangentialDistortion, CalibrationError> {
    let n_obs: usize = views.iter().map(Vec::len).sum();
    if n_obs < 4 {
        return Err(CalibrationError::Degenerate(
            "not enough corners for a distortion fit".into(),
        ));
    }
    let k_inv = k
        .matrix()
        .try_inverse()
        .ok_or(CalibrationError::InvalidIntrinsics)?;
    let to_norm = |p: [f64; 2]| {
        let n = k_inv * Vector3::new(p[0], p[1], 1.0);
        [n[0] / n[2], n[1] / n[2]]
    };

    let mut a = DMatrix::<f64>::zeros(2 * n_obs, 4);
    let mut rhs = DVector::<f64>::zeros(2 * n_obs);
    let mut row = 0;
    let mut max_r2 = 0.0f64;
    for (h, obs) in hs.iter().zip(views) {
        for (b, &o) in board.iter().zip(obs) {
            let ideal = to_norm(project(h, b[0], b[1]));
            let seen = to_norm(o);
            let [x, y] = ideal;
            let r2 = x * x + y * y;
            max_r2 = max_r2.max(r2);

            a[(row, 0)] = x * r2;
            a[(row, 1)] = x * r2 * r2;
            a[(row, 2)] = 2.0 * x * y;
            a[(row, 3)] = r2 + 2.0 * x * x;
            rhs[row] = seen[0] - x;

            a[(row + 1, 0)] = y * r2;
            a[(row + 1, 1)] = y * r2 * r2;
            a[(row + 1, 2)] = r2 + 2.0 * y * y;
            a[(row + 1, 3)] = 2.0 * x * y;
            rhs[row + 1] = seen[1] - y;
            row += 2;
        }
    }
    if max_r2 < 1e-6 {
        return Err(CalibrationError::Degenerate(
            "all corners sit on the optical axis".into(),
        ));
    }

    let sol = a
        .svd(true, true)
        .solve(&rhs, 1e-12)
        .map_err(|e| CalibrationError::Degenerate(e.to_string()))?;
    RadialTangentialDistortion::from_coefficients(&[sol[0], sol[1], sol[2], sol[3]])
        .ok_or(CalibrationError::InvalidDistortion { count: 4 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Rotation3, Vector3};

    fn truth() -> CameraIntrinsics {
        CameraIntrinsics::new(820.0, 815.0, 640.0, 360.0)
    }

    fn poses() -> Vec<(Rotation3<f64>, Vector3<f64>)> {
        vec![
            (Rotation3::from_euler_angles(0.15, 0.0, 0.05), Vector3::new(-60.0, -40.0, 420.0)),
            (Rotation3::from_euler_angles(-0.1, 0.2, -0.1), Vector3::new(-120.0, 10.0, 460.0)),
            (Rotation3::from_euler_angles(0.25, -0.15, 0.0), Vector3::new(0.0, -90.0, 380.0)),
            (Rotation3::from_euler_angles(0.0, 0.3, 0.1), Vector3::new(-150.0, -100.0, 500.0)),
            (Rotation3::from_euler_angles(-0.2, -0.1, -0.05), Vector3::new(20.0, 20.0, 440.0)),
        ]
    }

    /// Pinhole homography `K [r1 r2 t]` for one pose.
    fn plane_homography(k: &CameraIntrinsics, r: &Rotation3<f64>, t: &Vector3<f64>) -> Matrix3<f64> {
        let m = r.matrix();
        let mut rt = Matrix3::zeros();
        rt.set_column(0, &m.column(0));
        rt.set_column(1, &m.column(1));
        rt.set_column(2, t);
        k.matrix() * rt
    }

    fn synthetic_views(
        board: &CheckerboardSpec,
        dist: RadialTangentialDistortion,
    ) -> (Vec<Matrix3<f64>>, Vec<Vec<[f64; 2]>>) {
        let cam = CameraModel::new(truth(), dist);
        let pts = board.object_points();
        poses()
            .iter()
            .map(|(r, t)| {
                let h = plane_homography(&truth(), r, t);
                let obs = pts
                    .iter()
                    .map(|b| cam.distort_pixel(project(&h, b[0], b[1])).unwrap())
                    .collect();
                (h, obs)
            })
            .unzip()
    }

    #[test]
    fn object_points_are_row_major_millimeters() {
        let pts = CheckerboardSpec::default().object_points();
        assert_eq!(pts.len(), 54);
        assert_eq!(pts[1], [19.0, 0.0]);
        assert_eq!(pts[9], [0.0, 19.0]);
    }

    #[test]
    fn zhang_recovers_pinhole_intrinsics() {
        let (hs, _) = synthetic_views(&CheckerboardSpec::default(), Default::default());
        let k = intrinsics_from_homographies(&hs).unwrap();
        assert!((k.fx - 820.0).abs() < 1e-3, "fx {}", k.fx);
        assert!((k.fy - 815.0).abs() < 1e-3, "fy {}", k.fy);
        assert!((k.cx - 640.0).abs() < 1e-3, "cx {}", k.cx);
        assert!((k.cy - 360.0).abs() < 1e-3, "cy {}", k.cy);
        assert!(k.skew.abs() < 1e-6);
    }

    #[test]
    fn distortion_fit_is_exact_with_ideal_homographies() {
        let board = CheckerboardSpec::default();
        let dist = RadialTangentialDistortion {
            k1: -0.21,
            k2: 0.06,
            p1: 0.0015,
            p2: -0.001,
            k3: 0.0,
        };
        let (hs, views) = synthetic_views(&board, dist);
        let fit = fit_distortion(&truth(), &hs, &board.object_points(), &views).unwrap();
        assert!((fit.k1 - dist.k1).abs() < 1e-8);
        assert!((fit.k2 - dist.k2).abs() < 1e-7);
        assert!((fit.p1 - dist.p1).abs() < 1e-9);
        assert!((fit.p2 - dist.p2).abs() < 1e-9);
    }

    #[test]
    fn session_solves_distortion_free_views() {
        let board = CheckerboardSpec::default();
        let (_, views) = synthetic_views(&board, Default::default());
        let mut session = CalibrationSession::new(board, [1280, 720]).with_target_views(5);
        for v in views {
            session.add_view(v).unwrap();
        }
        assert!(session.is_complete());
        let report = session.solve().unwrap();
        let k = report.profile.camera.intrinsics;
        assert!((k.fx - 820.0).abs() < 1e-2);
        assert!((k.cy - 360.0).abs() < 1e-2);
        assert!(report.rms_px < 1e-4, "rms {}", report.rms_px);
        assert_eq!(report.profile.image_size, Some([1280, 720]));
    }

    #[test]
    fn session_recovers_lens_distortion() {
        let board = CheckerboardSpec::default();
        let dist = RadialTangentialDistortion {
            k1: -0.21,
            k2: 0.06,
            p1: 0.0015,
            p2: -0.001,
            k3: 0.0,
        };
        let (_, views) = synthetic_views(&board, dist);
        let mut session = CalibrationSession::new(board, [1280, 720]).with_target_views(5);
        for v in views {
            session.add_view(v).unwrap();
        }
        let report = session.solve().unwrap();
        let k = report.profile.camera.intrinsics;
        let d = report.profile.camera.distortion;
        assert!((k.fx - 820.0).abs() < 1.0, "fx {}", k.fx);
        assert!((k.fy - 815.0).abs() < 1.0, "fy {}", k.fy);
        assert!((k.cx - 640.0).abs() < 1.0, "cx {}", k.cx);
        assert!((k.cy - 360.0).abs() < 1.0, "cy {}", k.cy);
        assert!((d.k1 - dist.k1).abs() < 0.01, "k1 {}", d.k1);
        assert!((d.k2 - dist.k2).abs() < 0.05, "k2 {}", d.k2);
        assert!((d.p1 - dist.p1).abs() < 5e-4, "p1 {}", d.p1);
        assert!((d.p2 - dist.p2).abs() < 5e-4, "p2 {}", d.p2);
        assert!(report.rms_px < 0.05, "rms {}", report.rms_px);

        // corners of a fresh view land where the lens put them
        let pose = BoardPose::from_homography(
            &truth(),
            &plane_homography(&truth(), &poses()[2].0, &poses()[2].1),
        )
        .unwrap();
        let cam = refine::pack_camera(&k, &d);
        let truth_cam = refine::pack_camera(&truth(), &dist);
        let packed = [
            pose.rotation.x,
            pose.rotation.y,
            pose.rotation.z,
            pose.translation.x,
            pose.translation.y,
            pose.translation.z,
        ];
        for b in [[0.0, 0.0], [152.0, 95.0]] {
            let got = refine::project_board_point(cam.as_slice(), &packed, b);
            let want = refine::project_board_point(truth_cam.as_slice(), &packed, b);
            assert!((got[0] - want[0]).hypot(got[1] - want[1]) < 1.0);
        }
    }

    #[test]
    fn session_refuses_partial_views_and_short_runs() {
        let mut session = CalibrationSession::new(CheckerboardSpec::default(), [640, 480]);
        assert!(matches!(
            session.add_view(vec![[0.0, 0.0]; 10]),
            Err(CalibrationError::IncompleteView {
                expected: 54,
                got: 10
            })
        ));
        assert!(matches!(
            session.solve(),
            Err(CalibrationError::NotEnoughViews { needed: 3, got: 0 })
        ));
    }
}
