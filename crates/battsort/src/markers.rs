//! Tray fiducials and the per-frame pixel-to-world fit.
//!
//! Four square markers sit at the corners of the tray. Marker `i` has its
//! bottom-left corner on tray corner `i`:
//!
//! ```text
//!   3 ──────────── 2        y
//!   │              │        ▲
//!   │     tray     │        │
//!   0 ──────────── 1        └──▶ x
//! ```
//!
//! Observed image corners are expected in the usual fiducial order
//! (top-left, top-right, bottom-right, bottom-left as printed).

use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::homography::{fit_ransac, Homography, HomographyError, RansacConfig, RansacStats};

/// One decoded fiducial in an undistorted frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FiducialObservation {
    pub id: u32,
    /// Image corners, top-left first, clockwise as printed.
    pub corners: [[f64; 2]; 4],
}

/// Fiducial decoder seam. The dictionary decoding itself lives outside this
/// crate.
pub trait FiducialDetector: Send {
    fn detect(&mut self, frame: &RgbImage) -> Vec<FiducialObservation>;
}

/// Physical placement of the tray markers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MarkerGeometry {
    pub tray_length_mm: f64,
    pub tray_width_mm: f64,
    pub marker_size_mm: f64,
    /// Marker ids trusted for the fit. Anything else in view is ignored.
    pub accepted_ids: Vec<u32>,
}

impl Default for MarkerGeometry {
    fn default() -> Self {
        Self {
            tray_length_mm: 297.0,
            tray_width_mm: 210.0,
            marker_size_mm: 30.0,
            accepted_ids: vec![0, 1, 2, 3],
        }
    }
}

impl MarkerGeometry {
    pub fn validate(&self) -> Result<(), String> {
        for (name, v) in [
            ("tray_length_mm", self.tray_length_mm),
            ("tray_width_mm", self.tray_width_mm),
            ("marker_size_mm", self.marker_size_mm),
        ] {
            if !v.is_finite() || v <= 0.0 {
                return Err(format!("{name} must be finite and > 0"));
            }
        }
        if self.accepted_ids.is_empty() {
            return Err("accepted_ids must not be empty".into());
        }
        for (i, id) in self.accepted_ids.iter().enumerate() {
            if self.accepted_ids[..i].contains(id) {
                return Err(format!("accepted_ids has duplicate id {id}"));
            }
            if *id > 3 {
                return Err(format!("accepted id {id} has no tray corner (expected 0..=3)"));
            }
        }
        Ok(())
    }

    /// World corners of marker `id` in the same order as
    /// [`FiducialObservation::corners`]. `None` for ids without a tray corner.
    pub fn world_corners(&self, id: u32) -> Option<[[f64; 2]; 4]> {
        let (l, w, s) = (self.tray_length_mm, self.tray_width_mm, self.marker_size_mm);
        let [x0, y0] = match id {
            0 => [0.0, 0.0],
            1 => [l, 0.0],
            2 => [l, w],
            3 => [0.0, w],
            _ => return None,
        };
        Some([
            [x0, y0 + s],
            [x0 + s, y0 + s],
            [x0 + s, y0],
            [x0, y0],
        ])
    }
}

/// Homography for one frame plus the evidence it was fit from.
#[derive(Debug, Clone)]
pub struct MarkerFix {
    pub homography: Homography,
    pub marker_ids: Vec<u32>,
    pub stats: RansacStats,
}

/// Image/world point pairs from the accepted markers in view.
#[derive(Debug, Clone, Default)]
pub struct Correspondences {
    pub image: Vec<[f64; 2]>,
    pub world: Vec<[f64; 2]>,
    pub marker_ids: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct MarkerLocalizer {
    geometry: MarkerGeometry,
    ransac: RansacConfig,
}

impl MarkerLocalizer {
    pub fn new(geometry: MarkerGeometry) -> Self {
        Self {
            geometry,
            ransac: RansacConfig::default(),
        }
    }

    pub fn with_ransac(mut self, ransac: RansacConfig) -> Self {
        self.ransac = ransac;
        self
    }

    pub fn geometry(&self) -> &MarkerGeometry {
        &self.geometry
    }

    pub fn correspondences(&self, observations: &[FiducialObservation]) -> Correspondences {
        let mut out = Correspondences::default();
        for obs in observations {
            if !self.geometry.accepted_ids.contains(&obs.id) {
                continue;
            }
            let Some(world) = self.geometry.world_corners(obs.id) else {
                continue;
            };
            if obs.corners.iter().flatten().any(|v| !v.is_finite()) {
                continue;
            }
            out.image.extend_from_slice(&obs.corners);
            out.world.extend_from_slice(&world);
            out.marker_ids.push(obs.id);
        }
        out
    }

    /// Fit the pixel-to-world map for one frame's observations.
    ///
    /// `None` means no world projection is possible for this frame: fewer
    /// than four usable corners, a collinear set, or no consensus.
    pub fn locate(&self, observations: &[FiducialObservation]) -> Option<MarkerFix> {
        let corr = self.correspondences(observations);
        match fit_ransac(&corr.image, &corr.world, &self.ransac) {
            Ok(fit) => {
                let stats = RansacStats::from_fit(&fit, self.ransac.inlier_threshold);
                tracing::trace!(
                    "marker fix from ids {:?}: {}/{} inliers, mean {:.2}mm",
                    corr.marker_ids,
                    stats.n_inliers,
                    stats.n_points,
                    stats.mean_err
                );
                Some(MarkerFix {
                    homography: Homography::from_matrix(fit.h),
                    marker_ids: corr.marker_ids,
                    stats,
                })
            }
            Err(HomographyError::TooFewPoints { got, .. }) => {
                tracing::trace!("{got} marker corners visible, no homography this frame");
                None
            }
            Err(e) => {
                tracing::debug!("marker fit rejected: {e}");
                None
            }
        }
    }

    /// Detect and fit in one step.
    pub fn locate_in_frame(
        &self,
        detector: &mut dyn FiducialDetector,
        frame: &RgbImage,
    ) -> Option<MarkerFix> {
        let observations = detector.detect(frame);
        self.locate(&observations)
    }
}
