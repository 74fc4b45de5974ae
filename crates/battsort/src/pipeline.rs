//! Frame-to-mailbox vision loop.
//!
//! Per frame: undistort, fit the marker homography, run the object detector,
//! turn detections into candidates, project them onto the tray plane, keep
//! the one nearest the reference point, smooth, and offer the result to the
//! shared slot.

use std::sync::Arc;

use image::RgbImage;
use serde::Serialize;

use crate::calibration::{CalibrationError, CalibrationProfile};
use crate::camera::FrameProcessor;
use crate::candidates::{CandidateExtractor, ObjectDetector};
use crate::config::VisionConfig;
use crate::mailbox::{ClaimOutcome, SharedCoordinateSlot, WorkspaceFence};
use crate::markers::{FiducialDetector, MarkerFix, MarkerLocalizer};
use crate::pixelmap::FrameUndistorter;
use crate::projection::{nearest_to, project_all, WorldDetection};
use crate::smoothing::{DetectionSmoother, SmoothedDetection};

/// What one frame produced.
#[derive(Debug, Clone, Default)]
pub struct FrameReport {
    pub fix: Option<MarkerFix>,
    pub candidates: usize,
    pub detections: Vec<WorldDetection>,
    pub nearest: Option<WorldDetection>,
    pub emitted: Option<SmoothedDetection>,
    pub claim: Option<ClaimOutcome>,
}

/// Running counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames: u64,
    pub frames_with_fix: u64,
    pub emitted: u64,
    pub claims: u64,
}

pub struct VisionPipeline {
    undistorter: FrameUndistorter,
    localizer: MarkerLocalizer,
    fiducials: Box<dyn FiducialDetector>,
    objects: Box<dyn ObjectDetector>,
    extractor: CandidateExtractor,
    smoother: DetectionSmoother,
    slot: Arc<SharedCoordinateSlot>,
    fence: WorkspaceFence,
    confidence: f32,
    reference: [f64; 2],
    stats: PipelineStats,
}

impl VisionPipeline {
    pub fn new(
        profile: CalibrationProfile,
        cfg: &VisionConfig,
        fiducials: Box<dyn FiducialDetector>,
        objects: Box<dyn ObjectDetector>,
        slot: Arc<SharedCoordinateSlot>,
    ) -> Self {
        Self {
            undistorter: FrameUndistorter::new(profile, cfg.undistort_alpha),
            localizer: MarkerLocalizer::new(cfg.markers.clone()).with_ransac(cfg.ransac.clone()),
            fiducials,
            objects,
            extractor: CandidateExtractor::new(cfg.guard_px),
            smoother: DetectionSmoother::new(cfg.smoothing_window),
            slot,
            fence: cfg.fence,
            confidence: cfg.confidence,
            reference: cfg.reference_point_mm,
            stats: PipelineStats::default(),
        }
    }

    /// Load the calibration named in `cfg`. Without it no frame is processed.
    pub fn from_config(
        cfg: &VisionConfig,
        fiducials: Box<dyn FiducialDetector>,
        objects: Box<dyn ObjectDetector>,
        slot: Arc<SharedCoordinateSlot>,
    ) -> Result<Self, CalibrationError> {
        let profile = CalibrationProfile::load(&cfg.calibration_path)?;
        tracing::info!("vision calibration loaded from {}", cfg.calibration_path.display());
        Ok(Self::new(profile, cfg, fiducials, objects, slot))
    }

    /// Take over new thresholds, geometry and fence. The smoother restarts.
    pub fn apply_config(&mut self, cfg: &VisionConfig) {
        self.localizer = MarkerLocalizer::new(cfg.markers.clone()).with_ransac(cfg.ransac.clone());
        self.extractor = CandidateExtractor::new(cfg.guard_px);
        self.smoother = DetectionSmoother::new(cfg.smoothing_window);
        self.fence = cfg.fence;
        self.confidence = cfg.confidence;
        self.reference = cfg.reference_point_mm;
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn slot(&self) -> &Arc<SharedCoordinateSlot> {
        &self.slot
    }

    pub fn process(&mut self, raw: &RgbImage) -> FrameReport {
        self.stats.frames += 1;
        let frame = self.undistorter.undistort(raw);
        let fix = self
            .localizer
            .locate_in_frame(self.fiducials.as_mut(), &frame);
        if fix.is_some() {
            self.stats.frames_with_fix += 1;
        }

        let raw_detections = self.objects.detect(&frame, self.confidence);
        let candidates = self
            .extractor
            .extract([frame.width(), frame.height()], &raw_detections);
        let detections = project_all(&candidates, fix.as_ref().map(|f| &f.homography));
        let nearest = nearest_to(&detections, self.reference);

        let mut report = FrameReport {
            candidates: candidates.len(),
            nearest,
            ..Default::default()
        };
        if let Some(det) = nearest {
            if let Some(smoothed) = self.smoother.push(det) {
                self.stats.emitted += 1;
                let outcome = self.slot.try_claim(&smoothed, &self.fence);
                match outcome {
                    ClaimOutcome::Claimed => {
                        self.stats.claims += 1;
                        tracing::info!(
                            "claimed object {} at ({}, {}) theta {}",
                            smoothed.class_id,
                            smoothed.x_mm,
                            smoothed.y_mm,
                            smoothed.theta_deg
                        );
                    }
                    other => tracing::debug!("detection discarded: {other:?}"),
                }
                report.emitted = Some(smoothed);
                report.claim = Some(outcome);
            }
        }
        report.fix = fix;
        report.detections = detections;
        report
    }
}

impl FrameProcessor for VisionPipeline {
    fn on_frame(&mut self, frame: &RgbImage) {
        let report = self.process(frame);
        tracing::trace!(
            "frame: fix {}, {} candidates, {} projected",
            report.fix.is_some(),
            report.candidates,
            report.detections.len()
        );
    }
}
