use crate::audio::CaptureConstraints;
use crate::config::Config;
use crate::transcript::ReconnectPolicy;

/// Configuration for one session controller
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Sample rate declared in the handshake (backend expects 16kHz)
    pub sample_rate: u32,

    /// Synthesis provider declared in the handshake
    pub tts_provider: String,

    /// Base URL of the transcript feed
    pub transcript_base_url: String,

    /// Mine unrecognized messages for agent text
    pub fallback_extraction: bool,

    /// What to ask of the capture device
    pub constraints: CaptureConstraints,

    /// Transcript feed reconnection
    pub reconnect: ReconnectPolicy,

    /// Buffered UI updates per subscriber
    pub update_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            tts_provider: "elevenlabs".to_string(),
            transcript_base_url: "ws://localhost:8000".to_string(),
            fallback_extraction: false,
            constraints: CaptureConstraints::default(),
            reconnect: ReconnectPolicy::default(),
            update_capacity: 256,
        }
    }
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            sample_rate: config.audio.sample_rate,
            tts_provider: config.provisioning.tts_provider.clone(),
            transcript_base_url: config.transcript.base_url.clone(),
            fallback_extraction: config.transcript.fallback_extraction,
            constraints: CaptureConstraints::from(&config.audio),
            reconnect: ReconnectPolicy::from(&config.reconnect),
            ..Self::default()
        }
    }
}
