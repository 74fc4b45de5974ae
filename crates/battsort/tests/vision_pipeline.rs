mod common;

use std::sync::Arc;

use approx::assert_abs_diff_eq;
use image::RgbImage;
use parking_lot::Mutex;

use battsort::{
    CalibrationError, CalibrationProfile, ClaimOutcome, DetectionShape, FiducialDetector,
    FiducialObservation, MarkerGeometry, ObjectDetector, RawDetection, SharedCoordinateSlot,
    SmoothedDetection, VisionPipeline,
};

const W: u32 = 640;
const H: u32 = 480;

/// Tray millimeters to pixels: 1.5 px/mm, image y pointing down.
fn to_pixel(p: [f64; 2]) -> [f64; 2] {
    [1.5 * p[0] + 40.0, 440.0 - 1.5 * p[1]]
}

struct ScriptedMarkers {
    visible: Vec<u32>,
    geometry: MarkerGeometry,
}

impl FiducialDetector for ScriptedMarkers {
    fn detect(&mut self, _frame: &RgbImage) -> Vec<FiducialObservation> {
        self.visible
            .iter()
            .filter_map(|&id| {
                let world = self.geometry.world_corners(id)?;
                Some(FiducialObservation {
                    id,
                    corners: world.map(to_pixel),
                })
            })
            .collect()
    }
}

/// One 60x20 mm object at a fixed tray pose, plus a low-confidence ghost.
struct ScriptedObjects {
    center_mm: [f64; 2],
    theta_deg: f64,
    class_id: u32,
    thresholds: Arc<Mutex<Vec<f32>>>,
}

impl ObjectDetector for ScriptedObjects {
    fn detect(&mut self, _frame: &RgbImage, min_confidence: f32) -> Vec<RawDetection> {
        self.thresholds.lock().push(min_confidence);
        let (s, c) = self.theta_deg.to_radians().sin_cos();
        let [cx, cy] = self.center_mm;
        let outline: Vec<[f64; 2]> = [[-30.0, -10.0], [30.0, -10.0], [30.0, 10.0], [-30.0, 10.0]]
            .iter()
            .map(|[u, v]| to_pixel([cx + u * c - v * s, cy + u * s + v * c]))
            .collect();
        let all = [
            RawDetection {
                shape: DetectionShape::Polygon(outline),
                class_id: self.class_id,
                confidence: 0.9,
            },
            RawDetection {
                shape: DetectionShape::Box {
                    min: [300.0, 100.0],
                    max: [340.0, 130.0],
                },
                class_id: 7,
                confidence: 0.2,
            },
        ];
        all.into_iter()
            .filter(|d| d.confidence >= min_confidence)
            .collect()
    }
}

fn profile() -> CalibrationProfile {
    let k = [500.0, 0.0, 320.0, 0.0, 500.0, 240.0, 0.0, 0.0, 1.0];
    CalibrationProfile::from_arrays(&k, &[0.0; 4])
        .unwrap()
        .with_image_size([W, H])
}

struct Rig {
    pipeline: VisionPipeline,
    slot: Arc<SharedCoordinateSlot>,
    thresholds: Arc<Mutex<Vec<f32>>>,
}

fn rig(visible: Vec<u32>, center_mm: [f64; 2]) -> Rig {
    let cfg = common::cell_config();
    let slot = Arc::new(SharedCoordinateSlot::new());
    let thresholds = Arc::new(Mutex::new(Vec::new()));
    let markers = ScriptedMarkers {
        visible,
        geometry: cfg.vision.markers.clone(),
    };
    let objects = ScriptedObjects {
        center_mm,
        theta_deg: 30.0,
        class_id: 1,
        thresholds: Arc::clone(&thresholds),
    };
    let pipeline = VisionPipeline::new(
        profile(),
        &cfg.vision,
        Box::new(markers),
        Box::new(objects),
        Arc::clone(&slot),
    );
    Rig {
        pipeline,
        slot,
        thresholds,
    }
}

fn frame() -> RgbImage {
    RgbImage::new(W, H)
}

#[test]
fn steady_object_is_claimed_after_one_window() {
    let mut r = rig(vec![0, 1, 2, 3], [150.0, 100.0]);

    for _ in 0..2 {
        let report = r.pipeline.process(&frame());
        assert!(report.fix.is_some());
        assert_eq!(report.candidates, 1);
        assert!(report.emitted.is_none());
        assert!(r.slot.is_empty());
    }

    let report = r.pipeline.process(&frame());
    assert_eq!(report.claim, Some(ClaimOutcome::Claimed));
    let SmoothedDetection {
        x_mm,
        y_mm,
        theta_deg,
        class_id,
    } = report.emitted.unwrap();
    assert_abs_diff_eq!(x_mm, 150.0, epsilon = 1.5);
    assert_abs_diff_eq!(y_mm, 100.0, epsilon = 1.5);
    assert_abs_diff_eq!(theta_deg, 30.0, epsilon = 2.0);
    assert_eq!(class_id, 1);
    assert_eq!(x_mm, x_mm.trunc());

    let rec = r.slot.read().unwrap();
    assert_eq!((rec.x_mm, rec.y_mm, rec.object_id), (x_mm, y_mm, 1));

    assert!(r.thresholds.lock().iter().all(|&t| t == 0.5));
    let stats = r.pipeline.stats();
    assert_eq!((stats.frames, stats.frames_with_fix, stats.claims), (3, 3, 1));
}

#[test]
fn claimed_slot_is_not_overwritten() {
    let mut r = rig(vec![0, 1, 2, 3], [150.0, 100.0]);
    for _ in 0..3 {
        r.pipeline.process(&frame());
    }
    let first = r.slot.read().unwrap();

    let mut last = None;
    for _ in 0..3 {
        last = r.pipeline.process(&frame()).claim;
    }
    assert_eq!(last, Some(ClaimOutcome::Occupied));
    assert_eq!(r.slot.read().unwrap(), first);

    r.slot.clear();
    for _ in 0..3 {
        last = r.pipeline.process(&frame()).claim;
    }
    assert_eq!(last, Some(ClaimOutcome::Claimed));
}

#[test]
fn no_markers_in_view_means_no_projection() {
    let mut r = rig(vec![], [150.0, 100.0]);
    for _ in 0..5 {
        let report = r.pipeline.process(&frame());
        assert!(report.fix.is_none());
        assert_eq!(report.candidates, 1);
        assert!(report.detections.is_empty());
        assert!(report.emitted.is_none());
    }
    assert!(r.slot.is_empty());
}

#[test]
fn one_marker_in_view_is_enough() {
    let mut r = rig(vec![2], [150.0, 100.0]);
    let report = r.pipeline.process(&frame());
    let fix = report.fix.unwrap();
    assert_eq!(fix.marker_ids, vec![2]);
    assert_eq!(report.detections.len(), 1);
    let world = fix.homography.apply(to_pixel([200.0, 50.0])).unwrap();
    assert_abs_diff_eq!(world[0], 200.0, epsilon = 1e-3);
    assert_abs_diff_eq!(world[1], 50.0, epsilon = 1e-3);
}

#[test]
fn object_outside_the_fence_never_claims() {
    let mut r = rig(vec![0, 1, 2, 3], [150.0, 100.0]);
    let mut cfg = common::cell_config().vision;
    cfg.fence.max_x_mm = 120.0;
    r.pipeline.apply_config(&cfg);
    let mut last = None;
    for _ in 0..3 {
        last = r.pipeline.process(&frame()).claim;
    }
    assert_eq!(last, Some(ClaimOutcome::OutsideFence));
    assert!(r.slot.is_empty());
}

#[test]
fn object_at_the_frame_border_is_rejected() {
    // the outline reaches past the left edge of the frame
    let mut r = rig(vec![0, 1, 2, 3], [-20.0, 100.0]);
    let report = r.pipeline.process(&frame());
    assert!(report.fix.is_some());
    assert_eq!(report.candidates, 0);
}

#[test]
fn missing_calibration_stops_the_session() {
    let cfg = common::cell_config();
    let dir = tempfile::tempdir().unwrap();
    let mut vision = cfg.vision.clone();
    vision.calibration_path = dir.path().join("absent.npz");
    let err = VisionPipeline::from_config(
        &vision,
        Box::new(ScriptedMarkers {
            visible: vec![],
            geometry: vision.markers.clone(),
        }),
        Box::new(ScriptedObjects {
            center_mm: [0.0, 0.0],
            theta_deg: 0.0,
            class_id: 0,
            thresholds: Arc::default(),
        }),
        Arc::new(SharedCoordinateSlot::new()),
    )
    .err()
    .unwrap();
    assert!(matches!(err, CalibrationError::Io { .. }));
}

#[test]
fn saved_calibration_drives_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cam.npz");
    profile().save(&path).unwrap();

    let cfg = common::cell_config();
    let mut vision = cfg.vision.clone();
    vision.calibration_path = path;
    let slot = Arc::new(SharedCoordinateSlot::new());
    let mut pipeline = VisionPipeline::from_config(
        &vision,
        Box::new(ScriptedMarkers {
            visible: vec![0, 1, 2, 3],
            geometry: vision.markers.clone(),
        }),
        Box::new(ScriptedObjects {
            center_mm: [150.0, 100.0],
            theta_deg: 30.0,
            class_id: 0,
            thresholds: Arc::default(),
        }),
        Arc::clone(&slot),
    )
    .unwrap();
    for _ in 0..3 {
        pipeline.process(&frame());
    }
    assert!(!slot.is_empty());
}
