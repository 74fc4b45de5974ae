use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{RecvTimeoutError, Sender};
use parking_lot::RwLock;

use super::manipulator::{Manipulator, TakeRequest};
use super::protocol::{
    state_after_emit, ArmRole, ControlCommand, Inbound, ProtocolState, StepOutcome, Token,
};
use super::tray::{TrayCursor, TrayLayout};
use super::{AgentLink, AgentStatus};
use crate::camera::CaptureFlag;
use crate::config::ConfigStore;
use crate::mailbox::SharedCoordinateSlot;
use crate::motion::MotionError;

/// Copy of every token an agent sends, for logs and tests.
pub type TokenTap = Sender<(ArmRole, Token)>;

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// Every sender into the inbox is gone.
    Disconnected,
}

/// One arm's protocol state machine and its control loop.
pub struct AgentLoop {
    role: ArmRole,
    manipulator: Manipulator,
    link: AgentLink,
    slot: Arc<SharedCoordinateSlot>,
    capture: CaptureFlag,
    config: Arc<ConfigStore>,
    status: Arc<RwLock<AgentStatus>>,
    tray: TrayCursor,
    tap: Option<TokenTap>,

    state: ProtocolState,
    resume: ProtocolState,
    active: bool,
    /// Arm1Finished seen while B was still busy; starts the next cycle.
    pending_start: bool,
    capture_count: u32,
    held_object: Option<u32>,
    last_token_in: Option<Token>,
    last_token_out: Option<Token>,
    last_fault: Option<String>,
    cycles: u64,
}

impl AgentLoop {
    pub fn new(
        manipulator: Manipulator,
        link: AgentLink,
        slot: Arc<SharedCoordinateSlot>,
        capture: CaptureFlag,
        config: Arc<ConfigStore>,
    ) -> Self {
        let role = manipulator.role();
        let tray = TrayCursor::new(TrayLayout::new(config.snapshot().tray.clone()));
        Self {
            role,
            manipulator,
            link,
            slot,
            capture,
            config,
            status: Arc::new(RwLock::new(AgentStatus::new(role))),
            tray,
            tap: None,
            state: ProtocolState::Running,
            resume: ProtocolState::Running,
            active: false,
            pending_start: false,
            capture_count: 0,
            held_object: None,
            last_token_in: None,
            last_token_out: None,
            last_fault: None,
            cycles: 0,
        }
    }

    pub fn with_tap(mut self, tap: TokenTap) -> Self {
        self.tap = Some(tap);
        self
    }

    pub fn role(&self) -> ArmRole {
        self.role
    }

    pub fn state(&self) -> ProtocolState {
        self.state
    }

    pub fn capture_count(&self) -> u32 {
        self.capture_count
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn has_pending_start(&self) -> bool {
        self.pending_start
    }

    pub fn held_object(&self) -> Option<u32> {
        self.held_object
    }

    pub fn tray(&self) -> &TrayCursor {
        &self.tray
    }

    pub fn status_handle(&self) -> Arc<RwLock<AgentStatus>> {
        Arc::clone(&self.status)
    }

    /// Loop on `tick` until `stop` is raised or the inbox disconnects.
    pub fn run(mut self, stop: Arc<AtomicBool>) {
        tracing::info!("arm {} loop started", self.role);
        while !stop.load(Ordering::Acquire) {
            if self.tick(POLL_INTERVAL) == TickOutcome::Disconnected {
                tracing::warn!("arm {}: inbox disconnected", self.role);
                break;
            }
        }
        tracing::info!("arm {} loop stopped in state {}", self.role, self.state);
    }

    /// Wait up to `wait` for one inbound message, react to it, then take at
    /// most one step of the state machine.
    pub fn tick(&mut self, wait: Duration) -> TickOutcome {
        match self.link.inbox.recv_timeout(wait) {
            Ok(Inbound::Peer(token)) => self.on_peer_token(token),
            Ok(Inbound::Control(cmd)) => self.on_control(cmd),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return TickOutcome::Disconnected,
        }
        self.step();
        self.publish();
        TickOutcome::Continue
    }

    fn enter(&mut self, next: ProtocolState) {
        if next != self.state {
            tracing::info!("arm {}: {} -> {}", self.role, self.state, next);
            self.state = next;
        }
    }

    fn send(&mut self, token: Token) {
        tracing::info!("arm {} -> {}: {token}", self.role, self.role.peer());
        self.last_token_out = Some(token);
        if let Some(tap) = &self.tap {
            let _ = tap.send((self.role, token));
        }
        if self.link.peer.send(Inbound::Peer(token)).is_err() {
            tracing::warn!("arm {}: peer is gone, dropped {token}", self.role);
        }
    }

    fn fault(&mut self, what: &str, e: MotionError) {
        tracing::warn!("arm {} {what} failed in state {}: {e}", self.role, self.state);
        self.last_fault = Some(format!("{what}: {e}"));
    }

    fn on_peer_token(&mut self, token: Token) {
        self.last_token_in = Some(token);
        match (self.role, token, self.state) {
            (ArmRole::A, Token::VacOff, ProtocolState::FinishedA) => {
                // B must hold the id before the slot is cleared
                let object_id = self.slot.object_id();
                self.send(Token::GetBattInfo { object_id });
                self.enter(ProtocolState::VacOff);
            }
            (ArmRole::A, Token::GripBattChecked, ProtocolState::ResetBattInfo) => {
                self.enter(ProtocolState::Continue);
            }
            (ArmRole::A, Token::GetBattInfoSuccess, _) => {
                tracing::debug!("arm A: B confirmed object id");
            }
            (ArmRole::B, Token::Arm1Finished, _) if !self.active => {
                self.active = true;
                self.capture_count = 0;
                self.enter(ProtocolState::Running);
            }
            (ArmRole::B, Token::Arm1Finished, state) => {
                tracing::info!("arm B: arm1 finished while busy in state {state}, queued");
                self.pending_start = true;
            }
            (ArmRole::B, Token::GetBattInfo { object_id }, _) => {
                self.held_object = object_id;
                self.send(Token::GetBattInfoSuccess);
            }
            (ArmRole::B, Token::VacHasTurnedOff, ProtocolState::VacOff) => {
                self.capture_count = 0;
                self.enter(ProtocolState::VacTurnedOff);
            }
            (_, Token::Capture, _) => {
                tracing::trace!("arm {}: peer captured", self.role);
            }
            (role, token, state) => {
                tracing::debug!("arm {role}: ignored {token} in state {state}");
            }
        }
    }

    fn on_control(&mut self, cmd: ControlCommand) {
        tracing::info!("arm {}: control {cmd}", self.role);
        let result = match cmd {
            ControlCommand::Start => {
                if self.role == ArmRole::A {
                    self.active = true;
                } else {
                    tracing::debug!("arm B starts on arm1 finished, ignoring start");
                }
                Ok(())
            }
            ControlCommand::Stop => {
                self.manipulator.abort();
                self.active = false;
                self.pending_start = false;
                self.manipulator.set_tool_state(false)
            }
            ControlCommand::Home => self.manipulator.home(),
            ControlCommand::UpdateParameters => {
                let cfg = self.config.snapshot();
                self.tray.set_layout(TrayLayout::new(cfg.tray.clone()));
                self.manipulator.update_parameters(cfg.arm(self.role))
            }
            ControlCommand::Connect => self.manipulator.connect().map(|_| ()),
            ControlCommand::Disconnect => self.manipulator.disconnect(),
            ControlCommand::PowerOn => self.manipulator.power_on(),
            ControlCommand::PowerOff => self.manipulator.power_off(),
            ControlCommand::Enable => self.manipulator.enable(),
            ControlCommand::Disable => self.manipulator.disable(),
        };
        if let Err(e) = result {
            self.fault(&cmd.to_string(), e);
        }
        if let Err(e) = self.manipulator.update_status() {
            tracing::debug!("arm {}: status query failed: {e}", self.role);
        }
    }

    fn step(&mut self) {
        match (self.role, self.state) {
            (_, ProtocolState::CaptureWait) => {
                if !self.capture.is_requested() {
                    let resume = self.resume;
                    self.enter(resume);
                }
            }
            (ArmRole::A, ProtocolState::VacOff) => self.release_object(),
            (ArmRole::A, ProtocolState::Continue) => {
                self.capture_count = 0;
                self.cycles += 1;
                self.enter(ProtocolState::Running);
            }
            (_, ProtocolState::Running)
            | (ArmRole::B, ProtocolState::VacTurnedOff)
            | (ArmRole::B, ProtocolState::GripChecked) => self.advance(),
            _ => {}
        }
    }

    fn take_request(&self) -> Option<TakeRequest> {
        match self.role {
            ArmRole::A => {
                let start = self.slot.read()?;
                Some(TakeRequest {
                    start: Some(start),
                    ..Default::default()
                })
            }
            ArmRole::B => {
                let deposit = (self.state == ProtocolState::GripChecked).then(|| {
                    if self.held_object.is_none() {
                        tracing::warn!("arm B: no object id received, depositing in row 0");
                    }
                    self.tray.peek(self.held_object.unwrap_or(0))
                });
                Some(TakeRequest {
                    deposit,
                    ..Default::default()
                })
            }
        }
    }

    fn advance(&mut self) {
        if !self.active {
            return;
        }
        let Some(req) = self.take_request() else {
            return;
        };
        let state = self.state;
        match self.manipulator.take_object(state, self.capture_count, &req) {
            Ok(StepOutcome::Emit(Token::Capture)) => {
                self.capture.request();
                self.capture_count += 1;
                self.resume = state;
                self.enter(ProtocolState::CaptureWait);
                self.send(Token::Capture);
            }
            Ok(StepOutcome::Emit(token)) => {
                self.send(token);
                if let Some(next) = state_after_emit(self.role, token) {
                    self.enter(next);
                }
            }
            Ok(StepOutcome::Finished) => {
                let object_id = self.held_object.take().unwrap_or(0);
                self.tray.commit(object_id);
                self.capture_count = 0;
                self.cycles += 1;
                self.enter(ProtocolState::FinishedB);
                if std::mem::take(&mut self.pending_start) {
                    tracing::info!("arm B: starting queued cycle");
                    self.enter(ProtocolState::Running);
                } else {
                    self.active = false;
                }
            }
            Ok(StepOutcome::Idle) => {}
            Err(e) => self.fault("motion step", e),
        }
    }

    /// Arm A lets go of the object B is holding, empties the slot and
    /// reports back.
    fn release_object(&mut self) {
        if let Err(e) = self.manipulator.set_tool_state(false) {
            self.fault("tool release", e);
            return;
        }
        thread::sleep(self.manipulator.settings().release_settle);
        self.enter(ProtocolState::ResetBattInfo);
        self.slot.clear();
        if let Err(e) = self.manipulator.home() {
            self.fault("home after release", e);
        }
        self.send(Token::VacHasTurnedOff);
    }

    fn publish(&self) {
        let mut st = self.status.write();
        st.robot = self.manipulator.robot_state();
        st.state = self.state;
        st.active = self.active;
        st.capture_count = self.capture_count;
        st.held_object = self.held_object;
        st.last_token_in = self.last_token_in;
        st.last_token_out = self.last_token_out;
        st.last_fault.clone_from(&self.last_fault);
        st.cycles = self.cycles;
    }
}
