use serde::Serialize;
use serde_json::Value;

use super::state::CallState;
use crate::audio::AudioFrame;
use crate::protocol::TransportEvent;
use crate::transcript::{FeedEvent, Speaker, TranscriptEntry};

/// Internal event, tagged with the call it belongs to
///
/// Background tasks (capture forwarder, connection readers, playback units) only
/// ever send these; the controller consumes them one at a time and drops any
/// whose epoch is not the current call's.
#[derive(Debug)]
pub struct SessionEvent {
    pub epoch: u64,
    pub kind: EventKind,
}

impl SessionEvent {
    pub fn new(epoch: u64, kind: EventKind) -> Self {
        Self { epoch, kind }
    }
}

#[derive(Debug)]
pub enum EventKind {
    /// One block from the capture device
    Captured(AudioFrame),
    /// Call connection traffic
    Call(TransportEvent),
    /// Transcript feed traffic
    Feed(FeedEvent),
    /// A playback unit finished
    PlaybackDone(u64),
}

/// User actions fed to [`super::SessionController::run`]
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    Start,
    End,
    SendText(String),
    Shutdown,
}

/// State of the transcript feed as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptStatus {
    Connected,
    Reconnecting,
    Started,
    Ended,
    Error,
}

/// What the UI layer gets to see
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionUpdate {
    StateChanged {
        state: CallState,
        session_id: Option<String>,
    },
    Transcript {
        entry: TranscriptEntry,
    },
    Interim {
        entry: TranscriptEntry,
    },
    InterimCleared {
        speaker: Speaker,
    },
    Availability {
        slots: Value,
    },
    AvailabilityCleared,
    BookingConfirmed {
        booking: Value,
    },
    AgentSpeaking {
        is_speaking: bool,
    },
    UserSpeaking {
        is_speaking: bool,
    },
    TranscriptStatus {
        status: TranscriptStatus,
    },
    Failure {
        message: String,
        retryable: bool,
    },
}
