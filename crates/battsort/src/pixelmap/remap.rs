use image::RgbImage;
use imageproc::geometric_transformations::{warp_with, Interpolation};

use super::{PixelMapper, RectifiedView};
use crate::calibration::CalibrationProfile;

/// Precomputed per-pixel source coordinates for one output frame size.
///
/// Entry `y * width + x` holds the distorted source pixel sampled for output
/// pixel `(x, y)`, or NaN when the lens model has no preimage there.
#[derive(Debug, Clone)]
pub struct UndistortMap {
    width: u32,
    height: u32,
    source: Vec<[f32; 2]>,
}

impl UndistortMap {
    /// Tabulate `mapper.ideal_to_distorted` over every output pixel.
    pub fn from_mapper(mapper: &dyn PixelMapper, width: u32, height: u32) -> Self {
        let mut source = Vec::with_capacity(width as usize * height as usize);
        for y in 0..height {
            for x in 0..width {
                let src = mapper
                    .ideal_to_distorted([x as f64, y as f64])
                    .map(|p| [p[0] as f32, p[1] as f32])
                    .unwrap_or([f32::NAN, f32::NAN]);
                source.push(src);
            }
        }
        Self {
            width,
            height,
            source,
        }
    }

    pub fn size(&self) -> [u32; 2] {
        [self.width, self.height]
    }

    pub fn source_of(&self, x: u32, y: u32) -> Option<[f32; 2]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let p = self.source[(y * self.width + x) as usize];
        (p[0].is_finite() && p[1].is_finite()).then_some(p)
    }

    /// Resample `frame` through the table. Unmapped pixels are black.
    ///
    /// The frame must have the size the table was built for; the caller
    /// ([`FrameUndistorter`]) guarantees that.
    pub fn apply(&self, frame: &RgbImage) -> RgbImage {
        let oob = [-1.0f32, -1.0f32];
        warp_with(
            frame,
            |x, y| {
                let p = self
                    .source_of(x as u32, y as u32)
                    .unwrap_or(oob);
                (p[0], p[1])
            },
            Interpolation::Bilinear,
            image::Rgb([0, 0, 0]),
        )
    }
}

/// Frame undistorter bound to one calibration profile.
///
/// Keeps the remap table for the last frame size seen and rebuilds it only when
/// the incoming size changes.
#[derive(Debug, Clone)]
pub struct FrameUndistorter {
    profile: CalibrationProfile,
    alpha: f64,
    map: Option<UndistortMap>,
}

impl FrameUndistorter {
    /// `alpha` selects the output camera matrix, see
    /// [`CameraModel::optimal_new_intrinsics`](super::CameraModel::optimal_new_intrinsics).
    pub fn new(profile: CalibrationProfile, alpha: f64) -> Self {
        Self {
            profile,
            alpha,
            map: None,
        }
    }

    pub fn profile(&self) -> &CalibrationProfile {
        &self.profile
    }

    /// The rectified view used for frames of `size`.
    pub fn view_for(&self, size: [u32; 2]) -> RectifiedView {
        let lens = self.profile.camera;
        RectifiedView {
            lens,
            output: lens.optimal_new_intrinsics(size, self.alpha),
        }
    }

    pub fn undistort(&mut self, frame: &RgbImage) -> RgbImage {
        let size = [frame.width(), frame.height()];
        let stale = self.map.as_ref().map_or(true, |m| m.size() != size);
        if stale {
            tracing::debug!("building undistortion map for {}x{}", size[0], size[1]);
            let view = self.view_for(size);
            self.map = Some(UndistortMap::from_mapper(&view, size[0], size[1]));
        }
        match &self.map {
            Some(map) => map.apply(frame),
            None => frame.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixelmap::{CameraIntrinsics, CameraModel, RadialTangentialDistortion};

    struct Shift(f64);

    impl PixelMapper for Shift {
        fn distorted_to_ideal(&self, p: [f64; 2]) -> Option<[f64; 2]> {
            Some([p[0] - self.0, p[1]])
        }
        fn ideal_to_distorted(&self, p: [f64; 2]) -> Option<[f64; 2]> {
            Some([p[0] + self.0, p[1]])
        }
    }

    #[test]
    fn table_matches_mapper_pointwise() {
        let map = UndistortMap::from_mapper(&Shift(2.0), 8, 4);
        assert_eq!(map.size(), [8, 4]);
        assert_eq!(map.source_of(3, 1), Some([5.0, 1.0]));
        assert_eq!(map.source_of(8, 0), None);
    }

    #[test]
    fn shifted_table_moves_image_content() {
        let mut frame = RgbImage::new(8, 4);
        frame.put_pixel(5, 2, image::Rgb([200, 10, 10]));
        let out = UndistortMap::from_mapper(&Shift(2.0), 8, 4).apply(&frame);
        assert_eq!(out.get_pixel(3, 2).0, [200, 10, 10]);
        assert_eq!(out.get_pixel(5, 2).0, [0, 0, 0]);
    }

    #[test]
    fn undistorter_rebuilds_only_on_size_change() {
        let profile = CalibrationProfile::new(
            CameraModel::new(
                CameraIntrinsics::new(100.0, 100.0, 15.5, 11.5),
                RadialTangentialDistortion::default(),
            ),
            [32, 24],
        );
        let mut u = FrameUndistorter::new(profile, 0.0);
        let a = u.undistort(&RgbImage::from_pixel(32, 24, image::Rgb([9, 9, 9])));
        assert_eq!(a.dimensions(), (32, 24));
        assert_eq!(a.get_pixel(16, 12).0, [9, 9, 9]);
        let b = u.undistort(&RgbImage::new(16, 12));
        assert_eq!(b.dimensions(), (16, 12));
        assert_eq!(u.map.as_ref().map(UndistortMap::size), Some([16, 12]));
    }
}
