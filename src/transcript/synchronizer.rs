use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::protocol::TranscriptPayload;

/// Field names scanned when a message has no recognizable shape
const FALLBACK_TEXT_FIELDS: &[&str] = &["text", "transcript", "content", "message", "response", "output"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
}

impl Speaker {
    /// Map a wire role; anything that is not the caller is the agent.
    pub fn from_role(role: Option<&str>) -> Self {
        match role.map(|r| r.trim().to_ascii_lowercase()).as_deref() {
            Some("user") | Some("human") | Some("caller") | Some("customer") => Speaker::User,
            _ => Speaker::Agent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Speaker::User => "user",
            Speaker::Agent => "agent",
        }
    }
}

/// Which channel an entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptSource {
    /// Inline on the call connection
    Primary,
    /// The dedicated transcript feed
    Secondary,
    /// Recovered from an unrecognized message
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub id: String,
    pub speaker: Speaker,
    pub text: String,
    pub is_final: bool,
    /// Logical ordering key
    pub timestamp: String,
    pub source: TranscriptSource,
}

/// Result of feeding one message to the synchronizer
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// A final entry joined the transcript
    Appended(TranscriptEntry),
    /// The speaker's interim slot now holds this entry
    Interim(TranscriptEntry),
    /// A final entry emptied the speaker's interim slot without adding text
    InterimCleared(Speaker),
    /// Final entry already present (same id seen on the other channel).
    /// `cleared` names the speaker whose interim slot it still closed.
    Duplicate { id: String, cleared: Option<Speaker> },
    /// Nothing usable in the message
    Ignored,
}

/// Merges the call connection's and the transcript feed's entries into one
/// ordered, deduplicated transcript.
///
/// Finals are appended in arrival order and deduplicated by id. Each speaker has
/// at most one interim entry, kept apart from the finals and replaced in place
/// by every later entry for that speaker until a final arrives.
#[derive(Debug, Default)]
pub struct TranscriptSynchronizer {
    entries: Vec<TranscriptEntry>,
    seen: HashSet<String>,
    interim: HashMap<Speaker, TranscriptEntry>,
    sequence: u64,
    fallback_extraction: bool,
}

impl TranscriptSynchronizer {
    pub fn new(fallback_extraction: bool) -> Self {
        Self {
            fallback_extraction,
            ..Self::default()
        }
    }

    pub fn ingest(&mut self, payload: &TranscriptPayload, source: TranscriptSource) -> SyncOutcome {
        let speaker = Speaker::from_role(payload.role.as_deref());
        let text = payload.text.trim();

        if text.is_empty() {
            if payload.is_final && self.interim.remove(&speaker).is_some() {
                return SyncOutcome::InterimCleared(speaker);
            }
            return SyncOutcome::Ignored;
        }

        let (id, timestamp) = self.identify(payload, speaker);
        let entry = TranscriptEntry {
            id,
            speaker,
            text: text.to_string(),
            is_final: payload.is_final,
            timestamp,
            source,
        };

        if entry.is_final {
            self.commit(entry)
        } else {
            debug!("Interim [{}]: {}", speaker.as_str(), entry.text);
            self.interim.insert(speaker, entry.clone());
            SyncOutcome::Interim(entry)
        }
    }

    /// Best-effort recovery of text from an unrecognized message.
    ///
    /// Only active when fallback extraction is enabled; the text is attributed
    /// to the agent.
    pub fn ingest_unrecognized(&mut self, message: &Value) -> SyncOutcome {
        if !self.fallback_extraction {
            return SyncOutcome::Ignored;
        }

        let Some(text) = extract_text(message) else {
            return SyncOutcome::Ignored;
        };

        warn!("Recovered transcript text from unrecognized message shape");
        let payload = TranscriptPayload {
            role: Some("agent".to_string()),
            text,
            is_final: true,
            timestamp: message.get("timestamp").cloned(),
            metadata: None,
            id: message.get("id").and_then(Value::as_str).map(str::to_string),
        };
        self.ingest(&payload, TranscriptSource::Fallback)
    }

    /// Finalized entries, in arrival order
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn interim(&self, speaker: Speaker) -> Option<&TranscriptEntry> {
        self.interim.get(&speaker)
    }

    /// Live interim entries, user first
    pub fn interims(&self) -> Vec<&TranscriptEntry> {
        [Speaker::User, Speaker::Agent]
            .iter()
            .filter_map(|s| self.interim.get(s))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() || !self.interim.is_empty() {
            info!("Clearing transcript ({} entries)", self.entries.len());
        }
        self.entries.clear();
        self.seen.clear();
        self.interim.clear();
    }

    fn commit(&mut self, entry: TranscriptEntry) -> SyncOutcome {
        // A final always closes the speaker's pending utterance
        let cleared = self.interim.remove(&entry.speaker).map(|_| entry.speaker);

        if !self.seen.insert(entry.id.clone()) {
            debug!("Duplicate transcript entry {} suppressed", entry.id);
            return SyncOutcome::Duplicate {
                id: entry.id,
                cleared,
            };
        }

        info!("[{}] {}", entry.speaker.as_str(), entry.text);
        self.entries.push(entry.clone());
        SyncOutcome::Appended(entry)
    }

    fn identify(&mut self, payload: &TranscriptPayload, speaker: Speaker) -> (String, String) {
        let timestamp = payload.timestamp_key();

        if let Some(id) = payload.backend_id() {
            let timestamp = timestamp.unwrap_or_else(|| Utc::now().timestamp_millis().to_string());
            return (id, timestamp);
        }

        match timestamp {
            // Both channels stamp the same utterance identically
            Some(ts) => (format!("{}-{}", ts, speaker.as_str()), ts),
            None => {
                self.sequence += 1;
                let ts = Utc::now().timestamp_millis().to_string();
                (format!("{}-{}-{}", ts, speaker.as_str(), self.sequence), ts)
            }
        }
    }
}

/// Scan the candidate fields for the first non-empty string
pub fn extract_text(message: &Value) -> Option<String> {
    FALLBACK_TEXT_FIELDS.iter().find_map(|field| {
        message
            .get(*field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}
