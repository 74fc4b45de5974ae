use std::fs::File;
use std::path::Path;

use nalgebra::Matrix3;
use ndarray::{arr1, Array2, ArrayD};
use ndarray_npy::{NpzReader, NpzWriter};

use super::CalibrationError;
use crate::pixelmap::{CameraIntrinsics, CameraModel, RadialTangentialDistortion};

/// Calibrated camera: matrix `K`, distortion `D`, and the frame size the
/// calibration was solved on when known.
///
/// Loaded once when a camera session starts and never mutated; a
/// re-calibration produces a new profile.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CalibrationProfile {
    pub camera: CameraModel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_size: Option<[u32; 2]>,
}

impl CalibrationProfile {
    pub fn new(camera: CameraModel, image_size: [u32; 2]) -> Self {
        Self {
            camera,
            image_size: Some(image_size),
        }
    }

    /// Build from raw `K` (row-major 3x3) and a flat `D` of 4 or 5 entries.
    pub fn from_arrays(k: &[f64], d: &[f64]) -> Result<Self, CalibrationError> {
        if k.len() != 9 {
            return Err(CalibrationError::BadShape {
                name: "K",
                shape: vec![k.len()],
            });
        }
        let intrinsics = CameraIntrinsics::from_matrix(&Matrix3::from_row_slice(k))
            .ok_or(CalibrationError::InvalidIntrinsics)?;
        let distortion = RadialTangentialDistortion::from_coefficients(d)
            .ok_or(CalibrationError::InvalidDistortion { count: d.len() })?;
        Ok(Self {
            camera: CameraModel::new(intrinsics, distortion),
            image_size: None,
        })
    }

    /// Read a `.npz` archive holding arrays `K` (3x3 f64) and `D` (4 or 5
    /// f64 in any shape). An optional `size` array `[w, h]` is honored.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| CalibrationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut npz = NpzReader::new(file)?;
        let names = npz.names()?;

        let k = read_array(&mut npz, &names, "K")?
            .ok_or(CalibrationError::MissingArray { name: "K" })?;
        if k.shape() != [3, 3] {
            return Err(CalibrationError::BadShape {
                name: "K",
                shape: k.shape().to_vec(),
            });
        }
        let d = read_array(&mut npz, &names, "D")?
            .ok_or(CalibrationError::MissingArray { name: "D" })?;

        let mut profile = Self::from_arrays(
            &k.iter().copied().collect::<Vec<_>>(),
            &d.iter().copied().collect::<Vec<_>>(),
        )?;
        if let Some(size) = read_array(&mut npz, &names, "size")? {
            if let [w, h] = size.as_slice().unwrap_or_default() {
                if *w >= 1.0 && *h >= 1.0 {
                    profile.image_size = Some([*w as u32, *h as u32]);
                }
            }
        }
        tracing::info!(
            "loaded calibration {} (fx={:.1}, fy={:.1})",
            path.display(),
            profile.camera.intrinsics.fx,
            profile.camera.intrinsics.fy
        );
        Ok(profile)
    }

    /// Write `K`, `D` (1x5) and, when known, `size` to a `.npz` archive.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| CalibrationError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut npz = NpzWriter::new(file);

        let k = self.camera.intrinsics.matrix();
        let k_rows = Array2::from_shape_fn((3, 3), |(r, c)| k[(r, c)]);
        let d = Array2::from_shape_vec((1, 5), self.camera.distortion.coefficients().to_vec())
            .map_err(|_| CalibrationError::BadShape {
                name: "D",
                shape: vec![5],
            })?;
        npz.add_array("K", &k_rows)?;
        npz.add_array("D", &d)?;
        if let Some([w, h]) = self.image_size {
            npz.add_array("size", &arr1(&[w as f64, h as f64]))?;
        }
        npz.finish()?;
        Ok(())
    }

    /// Same profile with a known frame size.
    pub fn with_image_size(mut self, size: [u32; 2]) -> Self {
        self.image_size = Some(size);
        self
    }
}

fn read_array(
    npz: &mut NpzReader<File>,
    names: &[String],
    wanted: &str,
) -> Result<Option<ArrayD<f64>>, CalibrationError> {
    let Some(name) = names
        .iter()
        .find(|n| n.as_str() == wanted || n.strip_suffix(".npy") == Some(wanted))
    else {
        return Ok(None);
    };
    let arr: ArrayD<f64> = npz.by_name(name)?;
    Ok(Some(arr))
}
