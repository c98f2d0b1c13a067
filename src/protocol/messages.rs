use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SessionError;

/// Messages sent to the voice backend on the call connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Handshake, sent right after the connection opens
    BrowserAudio {
        action: String,
        #[serde(rename = "sampleRate")]
        sample_rate: u32,
        format: String,
        tts_provider: String,
    },
    Audio {
        data: String, // Base64-encoded PCM16 LE
    },
    UserText {
        text: String,
    },
    EndConversation,
}

impl OutboundMessage {
    pub fn handshake(sample_rate: u32, tts_provider: impl Into<String>) -> Self {
        OutboundMessage::BrowserAudio {
            action: "start".to_string(),
            sample_rate,
            format: "pcm16".to_string(),
            tts_provider: tts_provider.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::BrowserAudio { .. } => "browser_audio",
            OutboundMessage::Audio { .. } => "audio",
            OutboundMessage::UserText { .. } => "user_text",
            OutboundMessage::EndConversation => "end_conversation",
        }
    }
}

/// Transcript body shared by the call connection (`role`) and the transcript feed (`speaker`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptPayload {
    #[serde(default, alias = "speaker")]
    pub role: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub is_final: bool,
    /// Number or string, depending on the sender
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub id: Option<String>,
}

impl TranscriptPayload {
    /// Timestamp rendered as a string ordering key
    pub fn timestamp_key(&self) -> Option<String> {
        match &self.timestamp {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Backend-assigned id, top-level or under `metadata.id`
    pub fn backend_id(&self) -> Option<String> {
        self.id.clone().filter(|id| !id.is_empty()).or_else(|| {
            self.metadata
                .as_ref()
                .and_then(|m| m.get("id"))
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        })
    }
}

const CALL_MESSAGE_TYPES: &[&str] = &[
    "session_id",
    "audio",
    "transcript",
    "function_result",
    "booking_confirmed",
    "control",
    "agent_speaking",
    "user_speaking",
];

/// Messages received on the call connection
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    SessionId {
        session_id: String,
    },
    Audio {
        data: String,
    },
    Transcript(TranscriptPayload),
    FunctionResult {
        function_name: String,
        #[serde(default)]
        result: Value,
    },
    BookingConfirmed {
        #[serde(default)]
        booking: Value,
    },
    Control {
        action: String,
    },
    AgentSpeaking {
        is_speaking: bool,
    },
    UserSpeaking {
        is_speaking: bool,
    },
    /// Any shape without a known `type`
    #[serde(skip)]
    Unknown(Value),
}

impl InboundMessage {
    /// Parse one text frame.
    ///
    /// Unknown `type` values come back as `Unknown`; a known type with a bad body
    /// or non-JSON text is a protocol error.
    pub fn parse(text: &str) -> Result<Self, SessionError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SessionError::Protocol(format!("not JSON: {}", e)))?;

        match value.get("type").and_then(Value::as_str) {
            Some(kind) if CALL_MESSAGE_TYPES.contains(&kind) => {
                let kind = kind.to_string();
                serde_json::from_value(value)
                    .map_err(|e| SessionError::Protocol(format!("bad {} message: {}", kind, e)))
            }
            _ => Ok(InboundMessage::Unknown(value)),
        }
    }
}

/// `call_status.status` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Started,
    Ended,
    Error,
    #[serde(other)]
    Other,
}

const FEED_MESSAGE_TYPES: &[&str] = &["transcript", "call_status", "connected"];

/// Messages received on the transcript feed
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    Transcript(TranscriptPayload),
    CallStatus {
        status: CallStatus,
    },
    Connected {
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(skip)]
    Unknown(Value),
}

impl FeedMessage {
    pub fn parse(text: &str) -> Result<Self, SessionError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SessionError::Protocol(format!("not JSON: {}", e)))?;

        match value.get("type").and_then(Value::as_str) {
            Some(kind) if FEED_MESSAGE_TYPES.contains(&kind) => {
                let kind = kind.to_string();
                serde_json::from_value(value)
                    .map_err(|e| SessionError::Protocol(format!("bad {} message: {}", kind, e)))
            }
            _ => Ok(FeedMessage::Unknown(value)),
        }
    }
}
