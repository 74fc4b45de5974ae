use std::f64::consts::PI;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::protocol::{ArmRole, ProtocolState, StepOutcome, Token};
use super::tray::DepositTarget;
use crate::config::ArmConfig;
use crate::mailbox::SlotRecord;
use crate::motion::{JointPosition, MotionController, MotionError, MoveParams, Pose};

const USER_FRAME_ID: u8 = 1;
const TOOL_ID: u8 = 1;
const HOME_SPEED: f64 = 10.0;
const HOME_ACCEL: f64 = 5.0;

/// Arm parameters in controller units (mm, rad).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArmSettings {
    pub address: String,
    pub tool_channel: u32,
    pub speed_mm_s: f64,
    pub accel_mm_s2: f64,
    pub joint_speed_rad_s: f64,
    pub joint_accel_rad_s2: f64,
    pub home_joints: JointPosition,
    pub default_pose: Pose,
    pub end_pose: Pose,
    pub transfer_pose: Pose,
    pub tool_offset: Pose,
    pub user_frame: Pose,
    pub pick_lift_mm: f64,
    pub transfer_approach_mm: f64,
    pub release_settle: Duration,
}

impl From<&ArmConfig> for ArmSettings {
    fn from(cfg: &ArmConfig) -> Self {
        Self {
            address: cfg.address.clone(),
            tool_channel: cfg.tool_channel,
            speed_mm_s: cfg.speed_mm_s,
            accel_mm_s2: cfg.accel_mm_s2,
            joint_speed_rad_s: cfg.joint_speed_deg_s.to_radians(),
            joint_accel_rad_s2: cfg.joint_accel_deg_s2.to_radians(),
            home_joints: cfg.home_joints_deg.map(f64::to_radians),
            default_pose: Pose::from_degrees(cfg.tcp_default_pose),
            end_pose: Pose::from_degrees(cfg.tcp_end_pose),
            transfer_pose: Pose::from_degrees(cfg.tcp_transfer_pose),
            tool_offset: Pose::from_degrees(cfg.tool_offset),
            user_frame: Pose::from_degrees(cfg.user_frame),
            pick_lift_mm: cfg.pick_lift_mm,
            transfer_approach_mm: cfg.transfer_approach_mm,
            release_settle: Duration::from_millis(cfg.release_settle_ms),
        }
    }
}

/// Connection flags as last reported by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RobotState {
    pub connected: bool,
    pub powered: bool,
    pub enabled: bool,
}

/// Inputs to one motion step.
#[derive(Debug, Clone, Copy, Default)]
pub struct TakeRequest {
    /// Claimed object (arm A).
    pub start: Option<SlotRecord>,
    /// Inspection pose override; defaults to the configured end pose.
    pub end: Option<Pose>,
    /// Linear speed override in mm/s.
    pub speed: Option<f64>,
    /// Tray slot (arm B, deposit step).
    pub deposit: Option<DepositTarget>,
}

/// Camera tilt for inspection pose `count` of an object lying at `theta_deg`.
///
/// The first pose turns the object's long axis toward the camera while
/// keeping the wrist within ±90°; each later pose adds another -90°.
pub fn inspection_tilt(theta_deg: f64, count: u32) -> f64 {
    let base = if theta_deg < 90.0 {
        -theta_deg
    } else {
        90.0 - theta_deg
    };
    (base - 90.0 * count as f64).to_radians()
}

/// Extra wrist rotation at the transfer pose so B always receives the object
/// the same way round.
pub fn transfer_twist(theta_deg: f64) -> f64 {
    if theta_deg < 90.0 {
        (theta_deg - 90.0).to_radians()
    } else {
        (theta_deg + 90.0).to_radians()
    }
}

fn linear(s: &ArmSettings, blocking: bool, speed: f64) -> MoveParams {
    MoveParams::absolute(blocking, speed, s.accel_mm_s2)
}

fn joint(s: &ArmSettings, blocking: bool) -> MoveParams {
    MoveParams::absolute(blocking, s.joint_speed_rad_s, s.joint_accel_rad_s2)
}

/// One physical arm: command sequencing, tool actuation and unit handling.
pub struct Manipulator {
    role: ArmRole,
    controller: Box<dyn MotionController>,
    settings: ArmSettings,
    state: RobotState,
}

impl Manipulator {
    pub fn new(role: ArmRole, controller: Box<dyn MotionController>, settings: ArmSettings) -> Self {
        Self {
            role,
            controller,
            settings,
            state: RobotState::default(),
        }
    }

    pub fn role(&self) -> ArmRole {
        self.role
    }

    pub fn settings(&self) -> &ArmSettings {
        &self.settings
    }

    pub fn robot_state(&self) -> RobotState {
        self.state
    }

    /// Log in, power, enable and check the arm; when it reports ready,
    /// apply frames and tool, release the tool and home.
    pub fn connect(&mut self) -> Result<RobotState, MotionError> {
        tracing::info!("arm {}: connecting to {}", self.role, self.settings.address);
        self.controller.login()?;
        self.controller.power_on()?;
        self.controller.enable()?;
        let state = self.update_status()?;
        if !(state.powered && state.enabled) {
            return Err(MotionError::NotReady {
                powered: state.powered,
                enabled: state.enabled,
            });
        }
        self.apply_frames()?;
        self.home()?;
        tracing::info!("arm {} is ready", self.role);
        Ok(state)
    }

    /// Release the tool, then disable, power off and log out.
    pub fn disconnect(&mut self) -> Result<(), MotionError> {
        if let Err(e) = self.set_tool_state(false) {
            tracing::warn!("arm {}: tool release before disconnect failed: {e}", self.role);
        }
        self.controller.disable()?;
        self.state.enabled = false;
        self.controller.power_off()?;
        self.state.powered = false;
        self.controller.logout()?;
        self.state = RobotState::default();
        Ok(())
    }

    pub fn power_on(&mut self) -> Result<(), MotionError> {
        self.controller.power_on()
    }

    pub fn power_off(&mut self) -> Result<(), MotionError> {
        self.controller.disable()?;
        self.controller.power_off()
    }

    pub fn enable(&mut self) -> Result<(), MotionError> {
        self.controller.enable()
    }

    pub fn disable(&mut self) -> Result<(), MotionError> {
        self.controller.disable()
    }

    pub fn home(&mut self) -> Result<(), MotionError> {
        let params = MoveParams::absolute(true, HOME_SPEED, HOME_ACCEL);
        self.controller.joint_move(&self.settings.home_joints, params)
    }

    /// Best effort; errors are logged and dropped.
    pub fn abort(&mut self) {
        if let Err(e) = self.controller.motion_abort() {
            tracing::debug!("arm {}: abort ignored: {e}", self.role);
        }
    }

    pub fn set_tool_state(&mut self, on: bool) -> Result<(), MotionError> {
        self.controller
            .set_digital_output(self.settings.tool_channel, on)
    }

    pub fn update_status(&mut self) -> Result<RobotState, MotionError> {
        let st = self.controller.status()?;
        self.state = RobotState {
            connected: st.connected(),
            powered: st.powered,
            enabled: st.enabled,
        };
        Ok(self.state)
    }

    /// Take new parameters and, on a live session, push frames and tool
    /// data to the controller again.
    pub fn update_parameters(&mut self, cfg: &ArmConfig) -> Result<(), MotionError> {
        self.settings = ArmSettings::from(cfg);
        if self.state.connected {
            self.apply_frames()?;
        }
        Ok(())
    }

    fn apply_frames(&mut self) -> Result<(), MotionError> {
        let s = &self.settings;
        self.controller
            .set_user_frame(USER_FRAME_ID, &s.user_frame, "table_corner")?;
        self.controller.set_user_frame_id(USER_FRAME_ID)?;
        self.controller
            .set_tool_data(TOOL_ID, &s.tool_offset, "vacuum_tool")?;
        self.controller.set_tool_id(TOOL_ID)?;
        self.set_tool_state(false)
    }

    /// Run the motion step for `state` and report what to tell the peer.
    pub fn take_object(
        &mut self,
        state: ProtocolState,
        capture_count: u32,
        req: &TakeRequest,
    ) -> Result<StepOutcome, MotionError> {
        match (self.role, state) {
            (ArmRole::A, ProtocolState::Running) => self.pick_and_inspect(capture_count, req),
            (ArmRole::B, ProtocolState::Running) => self.receive_from_peer(req),
            (ArmRole::B, ProtocolState::VacTurnedOff) => self.inspect_turn(capture_count, req),
            (ArmRole::B, ProtocolState::GripChecked) => self.deposit(req),
            _ => Ok(StepOutcome::Idle),
        }
    }

    fn pick_and_inspect(
        &mut self,
        capture_count: u32,
        req: &TakeRequest,
    ) -> Result<StepOutcome, MotionError> {
        let start = req.start.ok_or(MotionError::NoTarget)?;
        let speed = req.speed.unwrap_or(self.settings.speed_mm_s);
        let mut end = req.end.unwrap_or(self.settings.end_pose);
        let theta = start.theta_deg;

        match capture_count {
            0 => {
                tracing::info!(
                    "arm A: picking at ({:.0}, {:.0}) theta {:.0}",
                    start.x_mm,
                    start.y_mm,
                    theta
                );
                let lift = self.settings.pick_lift_mm;
                let mut pose = self.settings.default_pose;
                pose.x = start.x_mm;
                pose.y = start.y_mm;
                pose.z += lift;
                self.controller.linear_move(&pose, linear(&self.settings, false, speed))?;
                pose.z -= lift;
                self.controller.linear_move(&pose, linear(&self.settings, false, speed))?;
                self.set_tool_state(true)?;
                pose.z += lift;
                self.controller.linear_move(&pose, linear(&self.settings, false, speed))?;

                end.ry = inspection_tilt(theta, 0);
                let here = self.controller.joint_position()?;
                let joints = self.controller.inverse_kinematics(&here, &end)?;
                self.controller.joint_move(&joints, joint(&self.settings, true))?;
                Ok(StepOutcome::Emit(Token::Capture))
            }
            1..=3 => {
                end.ry = inspection_tilt(theta, capture_count);
                self.controller.linear_move(&end, linear(&self.settings, true, speed))?;
                Ok(StepOutcome::Emit(Token::Capture))
            }
            _ => {
                let mut transfer = self.settings.transfer_pose;
                transfer.rz -= transfer_twist(theta);
                let here = self.controller.joint_position()?;
                let joints = self.controller.inverse_kinematics(&here, &transfer)?;
                self.controller.joint_move(&joints, joint(&self.settings, false))?;
                Ok(StepOutcome::Emit(Token::Arm1Finished))
            }
        }
    }

    fn receive_from_peer(&mut self, req: &TakeRequest) -> Result<StepOutcome, MotionError> {
        let speed = req.speed.unwrap_or(self.settings.speed_mm_s);
        let mut transfer = self.settings.transfer_pose;
        transfer.y += self.settings.transfer_approach_mm;
        self.controller.linear_move(&transfer, linear(&self.settings, false, speed))?;
        transfer.y -= self.settings.transfer_approach_mm;
        self.controller.linear_move(&transfer, linear(&self.settings, true, speed))?;
        self.set_tool_state(true)?;
        Ok(StepOutcome::Emit(Token::VacOff))
    }

    fn inspect_turn(&mut self, capture_count: u32, req: &TakeRequest) -> Result<StepOutcome, MotionError> {
        let speed = req.speed.unwrap_or(self.settings.speed_mm_s);
        let mut end = req.end.unwrap_or(self.settings.end_pose);
        match capture_count {
            0 => {
                self.controller.linear_move(&end, linear(&self.settings, true, speed))?;
                Ok(StepOutcome::Emit(Token::Capture))
            }
            1 => {
                end.ry += PI;
                self.controller.linear_move(&end, linear(&self.settings, true, speed))?;
                Ok(StepOutcome::Emit(Token::Capture))
            }
            _ => Ok(StepOutcome::Emit(Token::GripBattChecked)),
        }
    }

    fn deposit(&mut self, req: &TakeRequest) -> Result<StepOutcome, MotionError> {
        let slot = req.deposit.ok_or(MotionError::NoTarget)?;
        let speed = req.speed.unwrap_or(self.settings.speed_mm_s);
        tracing::info!(
            "arm B: depositing into tray row {} col {} at ({:.1}, {:.1})",
            slot.row,
            slot.col,
            slot.x_mm,
            slot.y_mm
        );
        let at = |z: f64| Pose::new(slot.x_mm, slot.y_mm, z, PI, 0.0, 0.0);
        self.controller.linear_move(
            &at(slot.approach_z_mm),
            MoveParams::absolute(false, speed, slot.accel_mm_s2),
        )?;
        self.controller
            .linear_move(&at(slot.drop_z_mm), linear(&self.settings, true, speed))?;
        self.set_tool_state(false)?;
        self.controller
            .linear_move(&at(slot.retract_z_mm), linear(&self.settings, false, speed))?;
        self.home()?;
        Ok(StepOutcome::Finished)
    }
}
