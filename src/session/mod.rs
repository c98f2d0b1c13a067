//! Call session management
//!
//! This module provides the `SessionController` that manages one voice call:
//! - Provisioning the call connection
//! - Microphone capture, gated until the backend is ready
//! - Gapless playback of synthesized audio
//! - Transcript reconciliation across the call connection and the transcript feed
//! - The call lifecycle state machine and its teardown

mod config;
mod controller;
mod events;
mod state;
mod stats;

pub use config::SessionConfig;
pub use controller::SessionController;
pub use events::{EventKind, SessionEvent, SessionUpdate, TranscriptStatus, UserCommand};
pub use state::{CallSession, CallState};
pub use stats::SessionStats;
