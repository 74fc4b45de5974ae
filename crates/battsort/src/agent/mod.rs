//! Manipulator agents and the token protocol between them.
//!
//! Each arm runs one [`AgentLoop`] on its own thread. The loops share no
//! protocol state: they exchange [`Token`]s over a pair of FIFO channels and
//! meet only at the coordinate slot (arm A) and the capture flag.

mod manipulator;
mod protocol;
mod tray;
mod worker;

pub use manipulator::{
    inspection_tilt, transfer_twist, ArmSettings, Manipulator, RobotState, TakeRequest,
};
pub use protocol::{
    state_after_emit, ArmRole, ControlCommand, Inbound, ProtocolState, StepOutcome, Token,
};
pub use tray::{DepositTarget, TrayCursor, TrayLayout};
pub use worker::{AgentLoop, TickOutcome, TokenTap};

use crossbeam::channel::{self, Receiver, Sender};
use serde::Serialize;

/// Read-only view of one agent, refreshed every tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStatus {
    pub role: ArmRole,
    pub robot: RobotState,
    pub state: ProtocolState,
    pub active: bool,
    pub capture_count: u32,
    /// Object id B holds for the next deposit.
    pub held_object: Option<u32>,
    pub last_token_in: Option<Token>,
    pub last_token_out: Option<Token>,
    pub last_fault: Option<String>,
    pub cycles: u64,
}

impl AgentStatus {
    pub fn new(role: ArmRole) -> Self {
        Self {
            role,
            robot: RobotState::default(),
            state: ProtocolState::Running,
            active: false,
            capture_count: 0,
            held_object: None,
            last_token_in: None,
            last_token_out: None,
            last_fault: None,
            cycles: 0,
        }
    }
}

/// One agent's ends of the channel pair.
#[derive(Debug, Clone)]
pub struct AgentLink {
    pub inbox: Receiver<Inbound>,
    pub peer: Sender<Inbound>,
}

/// Cross-wired links for A and B, plus a control sender into each inbox.
pub fn link_pair() -> ([AgentLink; 2], [Sender<Inbound>; 2]) {
    let (to_a, a_inbox) = channel::unbounded();
    let (to_b, b_inbox) = channel::unbounded();
    let links = [
        AgentLink {
            inbox: a_inbox,
            peer: to_b.clone(),
        },
        AgentLink {
            inbox: b_inbox,
            peer: to_a.clone(),
        },
    ];
    (links, [to_a, to_b])
}

/// Index of a role in the `[A, B]` arrays used across the cell.
pub fn role_index(role: ArmRole) -> usize {
    match role {
        ArmRole::A => 0,
        ArmRole::B => 1,
    }
}
