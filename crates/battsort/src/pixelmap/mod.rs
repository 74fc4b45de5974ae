//! Lens model and frame undistortion.

mod camera;
mod remap;

pub use camera::{
    CameraIntrinsics, CameraModel, RadialTangentialDistortion, RectifiedView, UndistortConfig,
};
pub use remap::{FrameUndistorter, UndistortMap};

/// Mapping between raw (distorted) image pixels and ideal pinhole pixels.
///
/// Both methods must be approximate inverses of each other. Return `None` if
/// a point cannot be mapped (outside the valid domain of the lens model).
///
/// # Example
///
/// ```
/// use battsort::PixelMapper;
///
/// struct Pinhole;
///
/// impl PixelMapper for Pinhole {
///     fn distorted_to_ideal(&self, p: [f64; 2]) -> Option<[f64; 2]> {
///         Some(p)
///     }
///     fn ideal_to_distorted(&self, p: [f64; 2]) -> Option<[f64; 2]> {
///         Some(p)
///     }
/// }
/// ```
pub trait PixelMapper {
    fn distorted_to_ideal(&self, distorted: [f64; 2]) -> Option<[f64; 2]>;
    fn ideal_to_distorted(&self, ideal: [f64; 2]) -> Option<[f64; 2]>;
}
