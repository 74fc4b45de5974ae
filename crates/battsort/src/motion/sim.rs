use std::sync::Arc;

use parking_lot::Mutex;

use super::{ControllerStatus, JointPosition, MotionController, MotionError, MoveParams, Pose};

/// One accepted controller call, as recorded by [`SimulatedController`].
#[derive(Debug, Clone, PartialEq)]
pub enum MotionCall {
    Login,
    Logout,
    PowerOn,
    PowerOff,
    Enable,
    Disable,
    JointMove(JointPosition),
    LinearMove(Pose),
    Abort,
    ToolData(u8, Pose),
    ToolId(u8),
    UserFrame(u8, Pose),
    UserFrameId(u8),
    DigitalOutput { channel: u32, level: bool },
}

#[derive(Debug, Default)]
struct SimState {
    logged_in: bool,
    powered: bool,
    enabled: bool,
    joints: JointPosition,
    outputs: Vec<(u32, bool)>,
    calls: Vec<MotionCall>,
    failing_moves: usize,
    refuse_power: bool,
}

/// Observer side of a [`SimulatedController`]; stays valid after the
/// controller has been moved into an agent thread.
#[derive(Debug, Clone)]
pub struct SimHandle(Arc<Mutex<SimState>>);

impl SimHandle {
    pub fn calls(&self) -> Vec<MotionCall> {
        self.0.lock().calls.clone()
    }

    pub fn output(&self, channel: u32) -> bool {
        self.0
            .lock()
            .outputs
            .iter()
            .rev()
            .find(|(c, _)| *c == channel)
            .is_some_and(|(_, level)| *level)
    }

    /// Make the next `n` move commands fail.
    pub fn fail_next_moves(&self, n: usize) {
        self.0.lock().failing_moves = n;
    }

    /// Simulate a cabinet that ignores power-on.
    pub fn refuse_power(&self, refuse: bool) {
        self.0.lock().refuse_power = refuse;
    }
}

/// In-process stand-in for the arm controller. Every accepted call is
/// recorded; motions require a logged-in, powered and enabled arm.
#[derive(Debug)]
pub struct SimulatedController {
    address: String,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedController {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    pub fn handle(&self) -> SimHandle {
        SimHandle(Arc::clone(&self.state))
    }

    fn ready(s: &SimState) -> Result<(), MotionError> {
        if !s.logged_in {
            return Err(MotionError::NotConnected);
        }
        if !(s.powered && s.enabled) {
            return Err(MotionError::NotReady {
                powered: s.powered,
                enabled: s.enabled,
            });
        }
        Ok(())
    }

    fn logged_in(s: &SimState) -> Result<(), MotionError> {
        if s.logged_in {
            Ok(())
        } else {
            Err(MotionError::NotConnected)
        }
    }

    fn try_move(s: &mut SimState, op: &'static str) -> Result<(), MotionError> {
        Self::ready(s)?;
        if s.failing_moves > 0 {
            s.failing_moves -= 1;
            return Err(MotionError::Rejected { op, code: -1 });
        }
        Ok(())
    }

    /// Stand-in kinematics: a fixed, invertible scaling of the pose.
    fn solve(target: &Pose) -> JointPosition {
        [
            target.x / 1000.0,
            target.y / 1000.0,
            target.z / 1000.0,
            target.rx,
            target.ry,
            target.rz,
        ]
    }
}

impl MotionController for SimulatedController {
    fn login(&mut self) -> Result<(), MotionError> {
        if self.address.is_empty() {
            return Err(MotionError::Unavailable {
                address: self.address.clone(),
                reason: "no address".into(),
            });
        }
        let mut s = self.state.lock();
        s.logged_in = true;
        s.calls.push(MotionCall::Login);
        Ok(())
    }

    fn logout(&mut self) -> Result<(), MotionError> {
        let mut s = self.state.lock();
        Self::logged_in(&s)?;
        s.logged_in = false;
        s.calls.push(MotionCall::Logout);
        Ok(())
    }

    fn power_on(&mut self) -> Result<(), MotionError> {
        let mut s = self.state.lock();
        Self::logged_in(&s)?;
        if !s.refuse_power {
            s.powered = true;
        }
        s.calls.push(MotionCall::PowerOn);
        Ok(())
    }

    fn power_off(&mut self) -> Result<(), MotionError> {
        let mut s = self.state.lock();
        Self::logged_in(&s)?;
        s.powered = false;
        s.enabled = false;
        s.calls.push(MotionCall::PowerOff);
        Ok(())
    }

    fn enable(&mut self) -> Result<(), MotionError> {
        let mut s = self.state.lock();
        Self::logged_in(&s)?;
        if !s.powered {
            return Err(MotionError::Rejected { op: "enable", code: 2 });
        }
        s.enabled = true;
        s.calls.push(MotionCall::Enable);
        Ok(())
    }

    fn disable(&mut self) -> Result<(), MotionError> {
        let mut s = self.state.lock();
        Self::logged_in(&s)?;
        s.enabled = false;
        s.calls.push(MotionCall::Disable);
        Ok(())
    }

    fn status(&mut self) -> Result<ControllerStatus, MotionError> {
        let s = self.state.lock();
        Ok(ControllerStatus {
            code: if s.logged_in { 0 } else { 1 },
            powered: s.powered,
            enabled: s.enabled,
        })
    }

    fn joint_move(&mut self, target: &JointPosition, _params: MoveParams) -> Result<(), MotionError> {
        let mut s = self.state.lock();
        Self::try_move(&mut s, "joint_move")?;
        s.joints = *target;
        s.calls.push(MotionCall::JointMove(*target));
        Ok(())
    }

    fn linear_move(&mut self, target: &Pose, _params: MoveParams) -> Result<(), MotionError> {
        let mut s = self.state.lock();
        Self::try_move(&mut s, "linear_move")?;
        s.joints = Self::solve(target);
        s.calls.push(MotionCall::LinearMove(*target));
        Ok(())
    }

    fn joint_position(&mut self) -> Result<JointPosition, MotionError> {
        let s = self.state.lock();
        Self::logged_in(&s)?;
        Ok(s.joints)
    }

    fn inverse_kinematics(
        &mut self,
        _reference: &JointPosition,
        target: &Pose,
    ) -> Result<JointPosition, MotionError> {
        let s = self.state.lock();
        Self::logged_in(&s)?;
        if target.to_array().iter().any(|v| !v.is_finite()) {
            return Err(MotionError::NoSolution);
        }
        Ok(Self::solve(target))
    }

    fn motion_abort(&mut self) -> Result<(), MotionError> {
        let mut s = self.state.lock();
        Self::logged_in(&s)?;
        s.calls.push(MotionCall::Abort);
        Ok(())
    }

    fn set_tool_data(&mut self, id: u8, offset: &Pose, _name: &str) -> Result<(), MotionError> {
        let mut s = self.state.lock();
        Self::logged_in(&s)?;
        s.calls.push(MotionCall::ToolData(id, *offset));
        Ok(())
    }

    fn set_tool_id(&mut self, id: u8) -> Result<(), MotionError> {
        let mut s = self.state.lock();
        Self::logged_in(&s)?;
        s.calls.push(MotionCall::ToolId(id));
        Ok(())
    }

    fn set_user_frame(&mut self, id: u8, frame: &Pose, _name: &str) -> Result<(), MotionError> {
        let mut s = self.state.lock();
        Self::logged_in(&s)?;
        s.calls.push(MotionCall::UserFrame(id, *frame));
        Ok(())
    }

    fn set_user_frame_id(&mut self, id: u8) -> Result<(), MotionError> {
        let mut s = self.state.lock();
        Self::logged_in(&s)?;
        s.calls.push(MotionCall::UserFrameId(id));
        Ok(())
    }

    fn set_digital_output(&mut self, channel: u32, level: bool) -> Result<(), MotionError> {
        let mut s = self.state.lock();
        Self::logged_in(&s)?;
        s.outputs.push((channel, level));
        s.calls.push(MotionCall::DigitalOutput { channel, level });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_sim() -> SimulatedController {
        let mut sim = SimulatedController::new("10.0.0.2");
        sim.login().unwrap();
        sim.power_on().unwrap();
        sim.enable().unwrap();
        sim
    }

    #[test]
    fn motion_requires_a_ready_arm() {
        let mut sim = SimulatedController::new("10.0.0.2");
        let p = MoveParams::absolute(true, 10.0, 5.0);
        assert_eq!(sim.linear_move(&Pose::default(), p), Err(MotionError::NotConnected));
        sim.login().unwrap();
        assert!(matches!(
            sim.joint_move(&[0.0; 6], p),
            Err(MotionError::NotReady { powered: false, .. })
        ));
    }

    #[test]
    fn injected_faults_are_consumed() {
        let mut sim = ready_sim();
        let h = sim.handle();
        h.fail_next_moves(1);
        let p = MoveParams::absolute(true, 10.0, 5.0);
        assert!(sim.linear_move(&Pose::default(), p).is_err());
        assert!(sim.linear_move(&Pose::default(), p).is_ok());
    }

    #[test]
    fn outputs_track_latest_level() {
        let mut sim = ready_sim();
        let h = sim.handle();
        assert!(!h.output(3));
        sim.set_digital_output(3, true).unwrap();
        assert!(h.output(3));
        sim.set_digital_output(3, false).unwrap();
        assert!(!h.output(3));
    }

    #[test]
    fn refused_power_blocks_enable() {
        let mut sim = SimulatedController::new("10.0.0.2");
        sim.handle().refuse_power(true);
        sim.login().unwrap();
        sim.power_on().unwrap();
        assert!(sim.enable().is_err());
        let st = sim.status().unwrap();
        assert!(st.connected() && !st.powered);
    }
}
