//! battsort — camera-guided pick, inspect and sort work cell.
//!
//! A fixed camera looks at a tray framed by four fiducials. The vision loop
//! turns each frame into at most one claimed world coordinate:
//!
//! 1. **Undistort** – remap through the calibrated lens model.
//! 2. **Markers** – robust pixel-to-millimeter homography from the tray
//!    fiducials.
//! 3. **Candidates** – detector masks to oriented rectangles, guard band at
//!    the frame border.
//! 4. **Projection** – centroid and long-axis angle on the tray plane.
//! 5. **Smoothing** – median over a window of nearest detections.
//! 6. **Mailbox** – single-slot claim inside the workspace fence.
//!
//! Two manipulator agents then hand the object over by exchanging protocol
//! tokens: arm A picks and inspects, arm B takes it, turns it and deposits
//! it into the tray grid. The [`WorkCell`] supervises both agents and the
//! camera threads.
//!
//! The object detector, the fiducial decoder, the motion controller and the
//! camera device are seams ([`ObjectDetector`], [`FiducialDetector`],
//! [`MotionController`], [`FrameSource`]); in-process stand-ins are provided
//! for simulation and tests.

pub mod agent;
pub mod calibration;
pub mod camera;
pub mod candidates;
pub mod cell;
pub mod config;
pub mod homography;
pub mod mailbox;
pub mod markers;
pub mod motion;
pub mod pipeline;
pub mod pixelmap;
pub mod projection;
pub mod smoothing;

pub use agent::{
    AgentLoop, AgentStatus, ArmRole, ControlCommand, Manipulator, ProtocolState, Token,
};
pub use calibration::{CalibrationError, CalibrationProfile, CalibrationSession, CheckerboardSpec};
pub use camera::{CameraWorker, CaptureFlag, FrameProcessor, FrameSource, SnapshotWriter};
pub use candidates::{DetectionShape, ObjectCandidate, ObjectDetector, RawDetection};
pub use cell::{CellError, ShutdownReport, WorkCell};
pub use config::{CellConfig, ConfigError, ConfigStore};
pub use homography::{Homography, HomographyError, RansacConfig};
pub use mailbox::{ClaimOutcome, SharedCoordinateSlot, SlotRecord, WorkspaceFence};
pub use markers::{FiducialDetector, FiducialObservation, MarkerGeometry, MarkerLocalizer};
pub use motion::{MotionController, MotionError, Pose, SimulatedController};
pub use pipeline::{FrameReport, VisionPipeline};
pub use pixelmap::{CameraIntrinsics, CameraModel, PixelMapper, RadialTangentialDistortion};
pub use projection::WorldDetection;
pub use smoothing::{DetectionSmoother, SmoothedDetection};
