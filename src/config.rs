use anyhow::{Context, Result};
use serde::Deserialize;

/// Environment overrides look like `VOICE_SESSION__PROVISIONING__SECURITY_KEY`
pub const ENV_PREFIX: &str = "VOICE_SESSION";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub provisioning: ProvisioningConfig,
    pub transcript: TranscriptConfig,
    pub audio: AudioConfig,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Endpoint that hands back the call connection URL
    pub url: String,
    pub security_key: String,
    pub tts_provider: String,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000/api/call".to_string(),
            security_key: String::new(),
            tts_provider: "elevenlabs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscriptConfig {
    /// Base URL of the transcript feed; `/transcript/<session_id>` is appended
    pub base_url: String,
    /// Mine unrecognized messages for agent text
    pub fallback_extraction: bool,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            base_url: "ws://localhost:8000".to_string(),
            fallback_extraction: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub frame_samples: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_samples: 1024,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl Config {
    /// Load from an optional config file, then environment overrides
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to load config from {}", path))?;

        let config: Config = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.audio.sample_rate == 0 {
            anyhow::bail!("audio.sample_rate must be non-zero");
        }
        if self.audio.frame_samples == 0 {
            anyhow::bail!("audio.frame_samples must be non-zero");
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            anyhow::bail!(
                "reconnect.initial_delay_ms ({}) exceeds reconnect.max_delay_ms ({})",
                self.reconnect.initial_delay_ms,
                self.reconnect.max_delay_ms
            );
        }
        Ok(())
    }
}
