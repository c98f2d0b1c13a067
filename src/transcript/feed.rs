// Secondary transcript feed
//
// A receive-only connection dedicated to transcript delivery, opened once the
// backend has assigned a session id. Unlike the call connection it reconnects
// on its own: exponential backoff from 1s, doubling, capped at 30s, given up
// after 5 failed reconnection attempts.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::ReconnectConfig;
use crate::protocol::{Connector, FeedMessage, TransportEvent};

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Reconnection attempts before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnection attempt `attempt` (1-based), or `None` once exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(
            self.initial_delay
                .checked_mul(factor)
                .unwrap_or(self.max_delay)
                .min(self.max_delay),
        )
    }
}

/// What the feed reports to its owner
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Connected,
    Message(FeedMessage),
    Reconnecting { attempt: u32, delay: Duration },
    /// No further attempts will be made
    GaveUp { attempts: u32 },
}

pub fn transcript_url(base_url: &str, session_id: &str) -> String {
    format!("{}/transcript/{}", base_url.trim_end_matches('/'), session_id)
}

/// Handle to the running feed task
pub struct TranscriptFeed {
    url: String,
    task: Option<JoinHandle<()>>,
}

impl TranscriptFeed {
    pub fn spawn<E, F>(
        connector: Arc<dyn Connector>,
        url: String,
        policy: ReconnectPolicy,
        events: mpsc::Sender<E>,
        wrap: F,
    ) -> Self
    where
        E: Send + 'static,
        F: Fn(FeedEvent) -> E + Send + 'static,
    {
        let task_url = url.clone();
        let task = tokio::spawn(async move {
            run_feed(connector, task_url, policy, events, wrap).await;
        });

        Self {
            url,
            task: Some(task),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Stop the feed. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("Transcript feed closed: {}", self.url);
        }
    }
}

impl Drop for TranscriptFeed {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_feed<E, F>(
    connector: Arc<dyn Connector>,
    url: String,
    policy: ReconnectPolicy,
    events: mpsc::Sender<E>,
    wrap: F,
) where
    F: Fn(FeedEvent) -> E,
{
    let mut failures: u32 = 0;

    loop {
        match connector.open_stream(&url).await {
            Ok(mut stream) => {
                info!("Transcript feed connected: {}", url);
                failures = 0;
                if events.send(wrap(FeedEvent::Connected)).await.is_err() {
                    return;
                }

                while let Some(event) = stream.next().await {
                    match event {
                        TransportEvent::Text(text) => match FeedMessage::parse(&text) {
                            Ok(message) => {
                                if events.send(wrap(FeedEvent::Message(message))).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => warn!("Dropping transcript feed message: {}", e),
                        },
                        TransportEvent::Closed { code } => {
                            warn!("Transcript feed closed (code {:?})", code);
                            break;
                        }
                        TransportEvent::Failed(reason) => {
                            warn!("Transcript feed error: {}", reason);
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!("Transcript feed connect failed: {}", e),
        }

        failures += 1;
        match policy.delay_for(failures) {
            Some(delay) => {
                info!(
                    "Reconnecting transcript feed in {:?} (attempt {}/{})",
                    delay, failures, policy.max_attempts
                );
                if events
                    .send(wrap(FeedEvent::Reconnecting {
                        attempt: failures,
                        delay,
                    }))
                    .await
                    .is_err()
                {
                    return;
                }
                tokio::time::sleep(delay).await;
            }
            None => {
                let attempts = failures - 1;
                error!("Transcript feed gave up after {} reconnection attempts", attempts);
                let _ = events.send(wrap(FeedEvent::GaveUp { attempts })).await;
                return;
            }
        }
    }
}
