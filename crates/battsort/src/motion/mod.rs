//! Motion-controller seam.
//!
//! The controller itself is external: this module fixes the capability set
//! the agents rely on and the unit convention (millimeters, radians).

mod sim;

pub use sim::{MotionCall, SimHandle, SimulatedController};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Joint angles in radians.
pub type JointPosition = [f64; 6];

/// Tool pose in the active user frame: position in mm, orientation in rad.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub rx: f64,
    pub ry: f64,
    pub rz: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, z: f64, rx: f64, ry: f64, rz: f64) -> Self {
        Self { x, y, z, rx, ry, rz }
    }

    /// Human-entry pose `[x, y, z, rx°, ry°, rz°]`.
    pub fn from_degrees(v: [f64; 6]) -> Self {
        Self::new(
            v[0],
            v[1],
            v[2],
            v[3].to_radians(),
            v[4].to_radians(),
            v[5].to_radians(),
        )
    }

    pub fn to_array(&self) -> [f64; 6] {
        [self.x, self.y, self.z, self.rx, self.ry, self.rz]
    }
}

/// Interpretation of a move target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveMode {
    Absolute,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoveParams {
    pub mode: MoveMode,
    /// Wait for the motion to finish before returning.
    pub blocking: bool,
    pub speed: f64,
    pub accel: f64,
    pub tolerance: f64,
}

impl MoveParams {
    pub fn absolute(blocking: bool, speed: f64, accel: f64) -> Self {
        Self {
            mode: MoveMode::Absolute,
            blocking,
            speed,
            accel,
            tolerance: 0.1,
        }
    }
}

/// Controller-reported state. `code == 0` means the session is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub code: i32,
    pub powered: bool,
    pub enabled: bool,
}

impl ControllerStatus {
    pub fn connected(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MotionError {
    #[error("controller at {address} is unavailable: {reason}")]
    Unavailable { address: String, reason: String },
    #[error("controller session is not logged in")]
    NotConnected,
    #[error("arm is not ready (powered: {powered}, enabled: {enabled})")]
    NotReady { powered: bool, enabled: bool },
    #[error("{op} rejected by controller with code {code}")]
    Rejected { op: &'static str, code: i32 },
    #[error("no inverse-kinematics solution for the target pose")]
    NoSolution,
    #[error("no target for the current step")]
    NoTarget,
}

/// External motion controller, one session per arm.
pub trait MotionController: Send {
    fn login(&mut self) -> Result<(), MotionError>;
    fn logout(&mut self) -> Result<(), MotionError>;
    fn power_on(&mut self) -> Result<(), MotionError>;
    fn power_off(&mut self) -> Result<(), MotionError>;
    fn enable(&mut self) -> Result<(), MotionError>;
    fn disable(&mut self) -> Result<(), MotionError>;
    fn status(&mut self) -> Result<ControllerStatus, MotionError>;

    fn joint_move(&mut self, target: &JointPosition, params: MoveParams) -> Result<(), MotionError>;
    fn linear_move(&mut self, target: &Pose, params: MoveParams) -> Result<(), MotionError>;
    fn joint_position(&mut self) -> Result<JointPosition, MotionError>;
    /// Joint solution for `target`, seeded from `reference`.
    fn inverse_kinematics(
        &mut self,
        reference: &JointPosition,
        target: &Pose,
    ) -> Result<JointPosition, MotionError>;
    fn motion_abort(&mut self) -> Result<(), MotionError>;

    fn set_tool_data(&mut self, id: u8, offset: &Pose, name: &str) -> Result<(), MotionError>;
    fn set_tool_id(&mut self, id: u8) -> Result<(), MotionError>;
    fn set_user_frame(&mut self, id: u8, frame: &Pose, name: &str) -> Result<(), MotionError>;
    fn set_user_frame_id(&mut self, id: u8) -> Result<(), MotionError>;
    fn set_digital_output(&mut self, channel: u32, level: bool) -> Result<(), MotionError>;
}
