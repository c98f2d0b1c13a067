use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Lifecycle of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    Idle,
    Connecting,
    Active,
    Ended,
    Error,
}

impl CallState {
    /// Connecting or active
    pub fn is_live(&self) -> bool {
        matches!(self, CallState::Connecting | CallState::Active)
    }

    pub fn can_transition_to(&self, next: CallState) -> bool {
        use CallState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Active)
                | (Connecting, Ended)
                | (Connecting, Error)
                | (Active, Ended)
                | (Active, Error)
                | (Ended, Idle)
                | (Error, Idle)
        )
    }
}

/// One voice call, live or just finished
#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    /// Client-side id, for log correlation before the backend assigns one
    pub local_id: String,

    /// Backend session id (known after the `session_id` message)
    pub id: Option<String>,

    pub state: CallState,

    pub started_at: Option<DateTime<Utc>>,

    /// Set when the call reaches `Ended` or `Error`
    pub ended_at: Option<DateTime<Utc>>,

    /// Message shown to the user after a failure
    pub last_error: Option<String>,
}

impl CallSession {
    pub fn new() -> Self {
        Self {
            local_id: uuid::Uuid::new_v4().to_string(),
            id: None,
            state: CallState::Idle,
            started_at: None,
            ended_at: None,
            last_error: None,
        }
    }

    /// Apply a transition. Returns false (and leaves the state alone) when it is not allowed.
    pub fn transition(&mut self, next: CallState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition_to(next) {
            warn!(
                "[{}] Refusing transition {:?} -> {:?}",
                self.local_id, self.state, next
            );
            return false;
        }

        info!("[{}] Call state {:?} -> {:?}", self.local_id, self.state, next);
        match next {
            CallState::Connecting => {
                self.started_at = Some(Utc::now());
                self.ended_at = None;
                self.last_error = None;
            }
            CallState::Ended | CallState::Error => self.ended_at = Some(Utc::now()),
            CallState::Idle | CallState::Active => {}
        }
        self.state = next;
        true
    }
}

impl Default for CallSession {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut call = CallSession::new();
        assert!(call.transition(CallState::Connecting));
        assert!(call.started_at.is_some());
        assert!(call.transition(CallState::Active));
        assert!(call.ended_at.is_none());
        assert!(call.transition(CallState::Ended));
        assert!(call.ended_at.is_some());
        assert!(call.transition(CallState::Idle));
    }

    #[test]
    fn test_error_only_returns_to_idle() {
        let mut call = CallSession::new();
        call.transition(CallState::Connecting);
        call.transition(CallState::Error);
        assert!(!call.transition(CallState::Active));
        assert!(!call.transition(CallState::Connecting));
        assert!(call.transition(CallState::Idle));
    }

    #[test]
    fn test_idle_cannot_jump_to_active() {
        let mut call = CallSession::new();
        assert!(!call.transition(CallState::Active));
        assert_eq!(call.state, CallState::Idle);
    }
}
