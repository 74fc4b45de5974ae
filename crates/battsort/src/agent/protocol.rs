//! Handoff vocabulary shared by the two arm loops.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which seat an agent occupies. A picks from the table, B deposits into the
/// tray.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArmRole {
    A,
    B,
}

impl ArmRole {
    pub fn peer(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for ArmRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::A => "A",
            Self::B => "B",
        })
    }
}

/// Fire-and-forget message from one arm to the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Token {
    Capture,
    Arm1Finished,
    VacOff,
    /// A hands B the id of the object it is about to release.
    GetBattInfo { object_id: Option<u32> },
    GetBattInfoSuccess,
    VacHasTurnedOff,
    GripBattChecked,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Capture => "capture",
            Self::Arm1Finished => "arm1 finished",
            Self::VacOff => "vac off",
            Self::GetBattInfo { .. } => "get batt info",
            Self::GetBattInfoSuccess => "get batt info success",
            Self::VacHasTurnedOff => "vac has turned off",
            Self::GripBattChecked => "grip batt checked",
        })
    }
}

/// Named protocol states of one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolState {
    Running,
    CaptureWait,
    VacOff,
    VacTurnedOff,
    GripChecked,
    ResetBattInfo,
    Continue,
    FinishedA,
    FinishedB,
}

impl fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::CaptureWait => "capture-wait",
            Self::VacOff => "vac-off",
            Self::VacTurnedOff => "vac-turned-off",
            Self::GripChecked => "grip-checked",
            Self::ResetBattInfo => "reset-batt-info",
            Self::Continue => "continue",
            Self::FinishedA => "finished-A",
            Self::FinishedB => "finished-B",
        })
    }
}

/// What a motion step produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Send this token to the peer.
    Emit(Token),
    /// The cycle ended without a token (B after depositing).
    Finished,
    /// Nothing to do in this state.
    Idle,
}

/// State an agent moves to after emitting `token` from a motion step.
/// `None` for tokens that do not come out of a motion step.
pub fn state_after_emit(role: ArmRole, token: Token) -> Option<ProtocolState> {
    match (role, token) {
        (_, Token::Capture) => Some(ProtocolState::CaptureWait),
        (ArmRole::A, Token::Arm1Finished) => Some(ProtocolState::FinishedA),
        (ArmRole::B, Token::VacOff) => Some(ProtocolState::VacOff),
        (ArmRole::B, Token::GripBattChecked) => Some(ProtocolState::GripChecked),
        _ => None,
    }
}

/// Operator command delivered on an agent's inbound channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlCommand {
    /// Let arm A begin picking.
    Start,
    Stop,
    Home,
    UpdateParameters,
    Connect,
    Disconnect,
    PowerOn,
    PowerOff,
    Enable,
    Disable,
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Home => "home",
            Self::UpdateParameters => "update-parameters",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::PowerOn => "power-on",
            Self::PowerOff => "power-off",
            Self::Enable => "enable",
            Self::Disable => "disable",
        })
    }
}

/// Everything an agent can receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Peer(Token),
    Control(ControlCommand),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_the_protocol_vocabulary() {
        assert_eq!(Token::Arm1Finished.to_string(), "arm1 finished");
        assert_eq!(Token::GetBattInfo { object_id: Some(2) }.to_string(), "get batt info");
        assert_eq!(ProtocolState::ResetBattInfo.to_string(), "reset-batt-info");
        assert_eq!(ControlCommand::UpdateParameters.to_string(), "update-parameters");
    }

    #[test]
    fn emitted_tokens_drive_role_specific_states() {
        assert_eq!(
            state_after_emit(ArmRole::A, Token::Capture),
            Some(ProtocolState::CaptureWait)
        );
        assert_eq!(
            state_after_emit(ArmRole::A, Token::Arm1Finished),
            Some(ProtocolState::FinishedA)
        );
        assert_eq!(state_after_emit(ArmRole::A, Token::VacOff), None);
        assert_eq!(
            state_after_emit(ArmRole::B, Token::GripBattChecked),
            Some(ProtocolState::GripChecked)
        );
        assert_eq!(ArmRole::A.peer(), ArmRole::B);
    }
}
