//! Control-signal interpreter
//!
//! Filters inbound control messages and connection closures down to the few
//! that are allowed to change the call lifecycle. The backend emits transient
//! control noise (interruption detection, soft "end" hints); only
//! `terminate` and `force_disconnect` end a call from the remote side.

use tracing::{info, warn};

use crate::session::CallState;

/// `control.action` values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    Cancel,
    End,
    Interruption,
    Terminate,
    ForceDisconnect,
    Other(String),
}

impl ControlSignal {
    pub fn parse(action: &str) -> Self {
        match action.trim().to_ascii_lowercase().as_str() {
            "cancel" => ControlSignal::Cancel,
            "end" => ControlSignal::End,
            "interruption" => ControlSignal::Interruption,
            "terminate" => ControlSignal::Terminate,
            "force_disconnect" => ControlSignal::ForceDisconnect,
            _ => ControlSignal::Other(action.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ControlSignal::Cancel => "cancel",
            ControlSignal::End => "end",
            ControlSignal::Interruption => "interruption",
            ControlSignal::Terminate => "terminate",
            ControlSignal::ForceDisconnect => "force_disconnect",
            ControlSignal::Other(action) => action,
        }
    }
}

/// What the controller should do with a signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlDecision {
    /// Log and carry on
    Ignore,
    /// Tear the call down, ending in `Ended`
    Terminate,
    /// Tear the call down, ending in `Error`
    Fail(String),
}

/// Decide what an inbound `control` message does to the call.
pub fn interpret(signal: &ControlSignal, state: CallState) -> ControlDecision {
    match signal {
        ControlSignal::Terminate | ControlSignal::ForceDisconnect => {
            info!("Control signal '{}' ends the call (state={:?})", signal.as_str(), state);
            ControlDecision::Terminate
        }
        ControlSignal::Cancel | ControlSignal::End | ControlSignal::Interruption => {
            info!(
                "Ignoring control signal '{}'; call stays {:?}",
                signal.as_str(),
                state
            );
            ControlDecision::Ignore
        }
        ControlSignal::Other(action) => {
            warn!("Ignoring unknown control signal '{}'", action);
            ControlDecision::Ignore
        }
    }
}

/// Decide what a call-connection close does to the call.
///
/// Before the call is active a close is a transport failure. Once active it is
/// only logged: the call stays up until the user ends it.
pub fn interpret_close(code: Option<u16>, state: CallState) -> ControlDecision {
    match state {
        CallState::Connecting => {
            ControlDecision::Fail(format!("connection closed before the call started (code {:?})", code))
        }
        CallState::Active => {
            warn!(
                "Call connection closed while active (code {:?}); waiting for the user to end the call",
                code
            );
            ControlDecision::Ignore
        }
        _ => ControlDecision::Ignore,
    }
}

/// Decide what a call-connection socket error does to the call.
pub fn interpret_failure(reason: &str, state: CallState) -> ControlDecision {
    match state {
        CallState::Connecting | CallState::Active => {
            ControlDecision::Fail(format!("connection error: {}", reason))
        }
        _ => ControlDecision::Ignore,
    }
}
