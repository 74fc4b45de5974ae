//! Joint Levenberg-Marquardt refinement of intrinsics, distortion and board
//! poses over every corner reprojection residual.
//!
//! Parameter blocks:
//! - `intrinsics`: `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`
//! - `pose<i>`: `[rx, ry, rz, tx, ty, tz]`, axis-angle rotation and board
//!   translation in millimeters

use std::collections::HashMap;

use nalgebra::{convert, DVector, Matrix3, RealField, Rotation3, Vector3};

use crate::pixelmap::{CameraIntrinsics, RadialTangentialDistortion};

const INTRINSICS: &str = "intrinsics";

/// Board-to-camera transform of one view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoardPose {
    /// Axis-angle rotation (radians).
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
}

impl BoardPose {
    /// Decompose `H = K [r1 r2 t]` for a board lying in its own `z = 0`
    /// plane. The rotation is snapped to the closest orthonormal matrix.
    pub fn from_homography(k: &CameraIntrinsics, h: &Matrix3<f64>) -> Option<Self> {
        let a = k.matrix().try_inverse()? * h;
        let norm = a.column(0).norm();
        if !norm.is_finite() || norm < 1e-12 {
            return None;
        }
        // board in front of the camera
        let lambda = if a[(2, 2)] < 0.0 { -1.0 / norm } else { 1.0 / norm };
        let r1: Vector3<f64> = a.column(0) * lambda;
        let r2: Vector3<f64> = a.column(1) * lambda;
        let r3 = r1.cross(&r2);
        let m = Matrix3::from_columns(&[r1, r2, r3]);
        let pose = Self {
            rotation: Rotation3::from_matrix(&m).scaled_axis(),
            translation: a.column(2) * lambda,
        };
        pose.is_finite().then_some(pose)
    }

    fn is_finite(&self) -> bool {
        self.rotation.iter().chain(self.translation.iter()).all(|v| v.is_finite())
    }

    fn packed(&self) -> DVector<f64> {
        DVector::from_iterator(6, self.rotation.iter().chain(self.translation.iter()).copied())
    }

    fn unpack(v: &DVector<f64>) -> Option<Self> {
        if v.len() != 6 {
            return None;
        }
        let pose = Self {
            rotation: Vector3::new(v[0], v[1], v[2]),
            translation: Vector3::new(v[3], v[4], v[5]),
        };
        pose.is_finite().then_some(pose)
    }
}

/// Intrinsics and distortion in the `intrinsics` block layout.
pub fn pack_camera(k: &CameraIntrinsics, d: &RadialTangentialDistortion) -> DVector<f64> {
    DVector::from_vec(vec![
        k.fx, k.fy, k.cx, k.cy, d.k1, d.k2, d.p1, d.p2, d.k3,
    ])
}

fn unpack_camera(v: &DVector<f64>) -> Option<(CameraIntrinsics, RadialTangentialDistortion)> {
    if v.len() != 9 {
        return None;
    }
    let k = CameraIntrinsics::new(v[0], v[1], v[2], v[3]);
    let d = RadialTangentialDistortion::from_coefficients(&[v[4], v[5], v[6], v[7], v[8]])?;
    k.is_valid().then_some((k, d))
}

/// Pixel position of board point `(bx, by, 0)` for a packed camera and pose.
///
/// Generic so that the same model serves the solver's dual numbers and plain
/// `f64` error reporting.
pub fn project_board_point<T: RealField>(cam: &[T], pose: &[T], board: [f64; 2]) -> [T; 2] {
    let bx: T = convert(board[0]);
    let by: T = convert(board[1]);
    let (rx, ry, rz) = (pose[0].clone(), pose[1].clone(), pose[2].clone());

    // Rodrigues with an unnormalized axis: r x p and r (r . p) / theta^2
    let cross = [
        -(rz.clone() * by.clone()),
        rz.clone() * bx.clone(),
        rx.clone() * by.clone() - ry.clone() * bx.clone(),
    ];
    let theta2 = rx.clone() * rx.clone() + ry.clone() * ry.clone() + rz.clone() * rz.clone();
    let [px, py, pz] = if theta2 > convert::<f64, T>(1e-16) {
        let theta = theta2.clone().sqrt();
        let cos = theta.clone().cos();
        let sin_over = theta.clone().sin() / theta;
        let fold = (rx.clone() * bx.clone() + ry.clone() * by.clone()) / theta2
            * (T::one() - cos.clone());
        let [c0, c1, c2] = cross;
        [
            bx * cos.clone() + c0 * sin_over.clone() + rx * fold.clone(),
            by * cos + c1 * sin_over.clone() + ry * fold.clone(),
            c2 * sin_over + rz * fold,
        ]
    } else {
        let [c0, c1, c2] = cross;
        [bx + c0, by + c1, c2]
    };

    let z = pz + pose[5].clone();
    let x = (px + pose[3].clone()) / z.clone();
    let y = (py + pose[4].clone()) / z;

    let (fx, fy, cx, cy) = (cam[0].clone(), cam[1].clone(), cam[2].clone(), cam[3].clone());
    let (k1, k2, p1, p2, k3) = (
        cam[4].clone(),
        cam[5].clone(),
        cam[6].clone(),
        cam[7].clone(),
        cam[8].clone(),
    );
    let two: T = convert(2.0);
    let r2 = x.clone() * x.clone() + y.clone() * y.clone();
    let radial = T::one() + r2.clone() * (k1 + r2.clone() * (k2 + r2.clone() * k3));
    let xy = x.clone() * y.clone();
    let xd = x.clone() * radial.clone()
        + two.clone() * p1.clone() * xy.clone()
        + p2.clone() * (r2.clone() + two.clone() * x.clone() * x);
    let yd = y.clone() * radial
        + p1 * (r2 + two.clone() * y.clone() * y)
        + two * p2 * xy;
    [fx * xd + cx, fy * yd + cy]
}

#[derive(Debug, Clone)]
struct CornerFactor {
    board: [f64; 2],
    seen: [f64; 2],
}

impl<T: RealField> tiny_solver::factors::Factor<T> for CornerFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let [u, v] = project_board_point(params[0].as_slice(), params[1].as_slice(), self.board);
        DVector::from_vec(vec![
            u - convert::<f64, T>(self.seen[0]),
            v - convert::<f64, T>(self.seen[1]),
        ])
    }
}

/// Refined camera and per-view poses.
#[derive(Debug, Clone)]
pub struct Refined {
    pub intrinsics: CameraIntrinsics,
    pub distortion: RadialTangentialDistortion,
    pub poses: Vec<BoardPose>,
}

/// RMS reprojection error in pixels of `views` under a camera and poses.
pub fn reprojection_rms(
    k: &CameraIntrinsics,
    d: &RadialTangentialDistortion,
    poses: &[BoardPose],
    board: &[[f64; 2]],
    views: &[Vec<[f64; 2]>],
) -> f64 {
    let cam = pack_camera(k, d);
    let mut sum = 0.0;
    let mut n = 0usize;
    for (pose, obs) in poses.iter().zip(views) {
        let pose = pose.packed();
        for (b, o) in board.iter().zip(obs) {
            let [u, v] = project_board_point(cam.as_slice(), pose.as_slice(), *b);
            sum += (u - o[0]).powi(2) + (v - o[1]).powi(2);
            n += 1;
        }
    }
    if n == 0 {
        f64::NAN
    } else {
        (sum / n as f64).sqrt()
    }
}

/// Minimize corner reprojection error over camera and poses jointly.
///
/// Returns `None` when the optimizer fails or leaves the camera invalid.
pub fn refine(
    board: &[[f64; 2]],
    views: &[Vec<[f64; 2]>],
    k: &CameraIntrinsics,
    d: &RadialTangentialDistortion,
    poses: &[BoardPose],
    max_iters: usize,
) -> Option<Refined> {
    use tiny_solver::Optimizer;

    if poses.len() != views.len() || views.is_empty() {
        return None;
    }
    let names: Vec<String> = (0..poses.len()).map(|i| format!("pose{i}")).collect();

    let mut problem = tiny_solver::Problem::new();
    for (name, obs) in names.iter().zip(views) {
        for (b, o) in board.iter().zip(obs) {
            problem.add_residual_block(
                2,
                &[INTRINSICS, name.as_str()],
                Box::new(CornerFactor {
                    board: *b,
                    seen: *o,
                }),
                None,
            );
        }
    }

    let mut initial_values = HashMap::<String, DVector<f64>>::new();
    initial_values.insert(INTRINSICS.to_string(), pack_camera(k, d));
    for (name, pose) in names.iter().zip(poses) {
        initial_values.insert(name.clone(), pose.packed());
    }

    let optimizer = tiny_solver::LevenbergMarquardtOptimizer::default();
    let options = tiny_solver::OptimizerOptions {
        max_iteration: max_iters.clamp(1, 500),
        verbosity_level: 0,
        ..Default::default()
    };
    let result = optimizer.optimize(&problem, &initial_values, Some(options))?;

    let (intrinsics, distortion) = unpack_camera(result.get(INTRINSICS)?)?;
    let poses = names
        .iter()
        .map(|name| BoardPose::unpack(result.get(name)?))
        .collect::<Option<Vec<_>>>()?;
    Some(Refined {
        intrinsics,
        distortion,
        poses,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn k() -> CameraIntrinsics {
        CameraIntrinsics::new(800.0, 790.0, 320.0, 240.0)
    }

    #[test]
    fn pose_is_recovered_from_its_homography() {
        let rot = Rotation3::from_euler_angles(0.2, -0.3, 0.1);
        let t = Vector3::new(-40.0, 25.0, 600.0);
        let m = rot.matrix();
        let h = k().matrix() * Matrix3::from_columns(&[m.column(0).into_owned(), m.column(1).into_owned(), t]);

        let pose = BoardPose::from_homography(&k(), &(h * -3.0)).unwrap();
        assert_abs_diff_eq!(pose.rotation, rot.scaled_axis(), epsilon = 1e-9);
        assert_abs_diff_eq!(pose.translation, t, epsilon = 1e-6);
    }

    #[test]
    fn projection_matches_pinhole_and_lens_model() {
        let rot = Rotation3::from_euler_angles(0.1, 0.25, -0.2);
        let t = Vector3::new(10.0, -20.0, 500.0);
        let pose = BoardPose {
            rotation: rot.scaled_axis(),
            translation: t,
        };
        let d = RadialTangentialDistortion {
            k1: -0.2,
            k2: 0.05,
            p1: 0.001,
            p2: -0.002,
            k3: 0.01,
        };
        let cam = pack_camera(&k(), &d);
        let b = [57.0, 38.0];

        let pc = rot * Vector3::new(b[0], b[1], 0.0) + t;
        let distorted = d.distort([pc.x / pc.z, pc.y / pc.z]);
        let want = k().normalized_to_pixel(distorted);
        let got = project_board_point(cam.as_slice(), pose.packed().as_slice(), b);
        assert_abs_diff_eq!(got[0], want[0], epsilon = 1e-9);
        assert_abs_diff_eq!(got[1], want[1], epsilon = 1e-9);
    }

    #[test]
    fn zero_rotation_takes_the_small_angle_branch() {
        let cam = pack_camera(&k(), &RadialTangentialDistortion::default());
        let pose = [0.0, 0.0, 0.0, 0.0, 0.0, 400.0];
        let [u, v] = project_board_point(cam.as_slice(), &pose, [40.0, -20.0]);
        assert_abs_diff_eq!(u, 320.0 + 800.0 * 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(v, 240.0 - 790.0 * 0.05, epsilon = 1e-12);
    }
}
