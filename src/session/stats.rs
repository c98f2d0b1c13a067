use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::CallState;

/// Statistics about a call session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    /// Lifecycle state when the snapshot was taken
    pub state: CallState,

    /// Backend session id, if assigned
    pub session_id: Option<String>,

    /// When the call was started
    pub started_at: Option<DateTime<Utc>>,

    /// When the call ended or failed
    pub ended_at: Option<DateTime<Utc>>,

    /// Seconds from start to end (or to now while live)
    pub duration_secs: f64,

    /// Whether captured audio is being transmitted
    pub interacting: bool,

    /// Audio frames sent to the backend
    pub frames_sent: u64,

    /// Audio frames captured before the backend was ready
    pub frames_dropped: u64,

    /// Synthesized audio units fully played
    pub playback_units_played: u64,

    /// Number of finalized transcript entries
    pub transcript_entries: usize,
}
