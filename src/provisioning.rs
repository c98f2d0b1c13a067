use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ProvisioningConfig;
use crate::error::SessionError;

/// Body of the call provisioning request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub security_key: String,
    pub tts_provider: String,
}

/// Provisioning response; backends disagree on the field name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionResponse {
    #[serde(default)]
    pub websocket_url: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub ws_url: Option<String>,
}

impl ProvisionResponse {
    /// First present field, in `websocket_url`, `url`, `ws_url` order
    pub fn connection_target(&self) -> Result<String, SessionError> {
        [&self.websocket_url, &self.url, &self.ws_url]
            .into_iter()
            .flatten()
            .find(|u| !u.trim().is_empty())
            .cloned()
            .ok_or_else(|| {
                SessionError::Provisioning("response carries no connection URL".to_string())
            })
    }
}

/// Hands back the URL for the call connection
#[async_trait::async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self) -> Result<String, SessionError>;
}

/// Provisioning over HTTP (reqwest)
pub struct HttpProvisioner {
    client: reqwest::Client,
    config: ProvisioningConfig,
}

impl HttpProvisioner {
    pub fn new(config: ProvisioningConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait::async_trait]
impl Provisioner for HttpProvisioner {
    async fn provision(&self) -> Result<String, SessionError> {
        info!("Requesting call connection from {}", self.config.url);

        let request = ProvisionRequest {
            security_key: self.config.security_key.clone(),
            tts_provider: self.config.tts_provider.clone(),
        };

        let response = self
            .client
            .post(&self.config.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| SessionError::Provisioning(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SessionError::Provisioning(format!(
                "provisioning returned HTTP {}",
                status
            )));
        }

        let body: ProvisionResponse = response
            .json()
            .await
            .map_err(|e| SessionError::Provisioning(format!("invalid response body: {}", e)))?;

        let target = body.connection_target()?;
        info!("Provisioned call connection");
        Ok(target)
    }
}

/// Always returns the same URL (local backends, tests)
pub struct StaticProvisioner {
    url: String,
}

impl StaticProvisioner {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait::async_trait]
impl Provisioner for StaticProvisioner {
    async fn provision(&self) -> Result<String, SessionError> {
        Ok(self.url.clone())
    }
}
