//! Calibration store: persisted camera profiles and the offline solver that
//! produces them.

mod profile;
mod refine;
mod solve;

pub use profile::CalibrationProfile;
pub use refine::{project_board_point, BoardPose};
pub use solve::{
    fit_distortion, intrinsics_from_homographies, CalibrationReport, CalibrationSession,
    CheckerboardSpec,
};

use std::path::PathBuf;

use thiserror::Error;

use crate::homography::HomographyError;

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("cannot access calibration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot read calibration archive: {0}")]
    ReadArchive(#[from] ndarray_npy::ReadNpzError),
    #[error("cannot write calibration archive: {0}")]
    WriteArchive(#[from] ndarray_npy::WriteNpzError),
    #[error("calibration archive has no array named {name}")]
    MissingArray { name: &'static str },
    #[error("array {name} has unexpected shape {shape:?}")]
    BadShape {
        name: &'static str,
        shape: Vec<usize>,
    },
    #[error("camera matrix is not a valid pinhole matrix")]
    InvalidIntrinsics,
    #[error("expected 4 or 5 finite distortion coefficients, got {count}")]
    InvalidDistortion { count: usize },
    #[error("need at least {needed} calibration views, got {got}")]
    NotEnoughViews { needed: usize, got: usize },
    #[error("checkerboard view has {got} corners, expected {expected}")]
    IncompleteView { expected: usize, got: usize },
    #[error("view homography failed: {0}")]
    Homography(#[from] HomographyError),
    #[error("calibration is degenerate: {0}")]
    Degenerate(String),
    #[error("reprojection refinement failed")]
    RefinementFailed,
}
