// Test doubles for the session engine's collaborators
//
// The connector hands out in-memory "servers": tests push transport events
// into a connection and inspect what the client sent.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use voice_session::audio::{AudioFrame, AudioSink, CaptureConstraints, CaptureDevice};
use voice_session::protocol::{Connector, EventStream, MessageSink, OutboundMessage, TransportEvent};
use voice_session::{
    Provisioner, SessionConfig, SessionController, SessionError, StaticProvisioner,
};

pub const CALL_URL: &str = "ws://backend.test/call";
pub const TRANSCRIPT_BASE: &str = "ws://backend.test";

/// Server side of one in-memory connection
#[derive(Clone)]
pub struct ServerHandle {
    pub url: String,
    pub tx: mpsc::UnboundedSender<TransportEvent>,
    pub sent: Arc<Mutex<Vec<OutboundMessage>>>,
    pub closes: Arc<AtomicUsize>,
}

impl ServerHandle {
    pub fn push_json(&self, json: serde_json::Value) {
        let _ = self.tx.send(TransportEvent::Text(json.to_string()));
    }

    pub fn push(&self, event: TransportEvent) {
        let _ = self.tx.send(event);
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent().iter().map(|m| m.kind()).collect()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

struct RecordingSink {
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl MessageSink for RecordingSink {
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), SessionError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockConnector {
    servers: Arc<Mutex<Vec<ServerHandle>>>,
    attempts: Arc<Mutex<Vec<String>>>,
    /// URLs containing this fragment fail to connect
    fail_matching: Arc<Mutex<Option<String>>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_urls_containing(&self, fragment: &str) {
        *self.fail_matching.lock().unwrap() = Some(fragment.to_string());
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn servers(&self) -> Vec<ServerHandle> {
        self.servers.lock().unwrap().clone()
    }

    pub fn call_server(&self) -> ServerHandle {
        self.servers()
            .into_iter()
            .rev()
            .find(|s| !s.url.contains("/transcript/"))
            .expect("no call connection opened")
    }

    pub fn feed_server(&self) -> Option<ServerHandle> {
        self.servers()
            .into_iter()
            .rev()
            .find(|s| s.url.contains("/transcript/"))
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    async fn open_duplex(
        &self,
        url: &str,
    ) -> Result<(Box<dyn MessageSink>, EventStream), SessionError> {
        self.attempts.lock().unwrap().push(url.to_string());

        if let Some(fragment) = self.fail_matching.lock().unwrap().as_deref() {
            if url.contains(fragment) {
                return Err(SessionError::Transport(format!("refused: {}", url)));
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ServerHandle {
            url: url.to_string(),
            tx,
            sent: Arc::new(Mutex::new(Vec::new())),
            closes: Arc::new(AtomicUsize::new(0)),
        };
        let sink = RecordingSink {
            sent: Arc::clone(&handle.sent),
            closes: Arc::clone(&handle.closes),
        };
        self.servers.lock().unwrap().push(handle);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Ok((Box::new(sink), Box::pin(stream)))
    }
}

/// Capture device fed by the test
#[derive(Clone, Default)]
pub struct MockDevice {
    pub frames: Arc<Mutex<Option<mpsc::Sender<AudioFrame>>>>,
    pub starts: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
    pub deny: bool,
    running: Arc<Mutex<bool>>,
    started: Arc<Mutex<Option<tokio::time::Instant>>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    /// Deliver one block as if from the audio callback
    pub async fn capture(&self, value: f32) {
        let elapsed = self
            .started
            .lock()
            .unwrap()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);
        self.capture_at(value, elapsed).await;
    }

    /// Deliver one block stamped with an explicit capture time
    pub async fn capture_at(&self, value: f32, timestamp_ms: u64) {
        let tx = self.frames.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx
                .send(AudioFrame {
                    samples: vec![value; 4],
                    sample_rate: 16000,
                    timestamp_ms,
                })
                .await;
        }
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CaptureDevice for MockDevice {
    async fn start(
        &mut self,
        _constraints: &CaptureConstraints,
    ) -> Result<mpsc::Receiver<AudioFrame>, SessionError> {
        if self.deny {
            return Err(SessionError::Device("permission denied".to_string()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        *self.frames.lock().unwrap() = Some(tx);
        *self.running.lock().unwrap() = true;
        *self.started.lock().unwrap() = Some(tokio::time::Instant::now());
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<(), SessionError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        *self.frames.lock().unwrap() = None;
        *self.running.lock().unwrap() = false;
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        *self.running.lock().unwrap()
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Records what was played and checks units never overlap
#[derive(Clone, Default)]
pub struct MockSink {
    pub played: Arc<Mutex<Vec<Vec<f32>>>>,
    active: Arc<AtomicUsize>,
    pub overlaps: Arc<AtomicUsize>,
    pub unit_duration: Duration,
}

impl MockSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_duration(unit_duration: Duration) -> Self {
        Self {
            unit_duration,
            ..Self::default()
        }
    }

    pub fn played(&self) -> Vec<Vec<f32>> {
        self.played.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl AudioSink for MockSink {
    async fn play(&self, samples: Vec<f32>) -> Result<(), SessionError> {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(self.unit_duration).await;
        self.played.lock().unwrap().push(samples);
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

pub struct FailingProvisioner;

#[async_trait::async_trait]
impl Provisioner for FailingProvisioner {
    async fn provision(&self) -> Result<String, SessionError> {
        Err(SessionError::Provisioning("HTTP 500".to_string()))
    }
}

pub struct Harness {
    pub controller: SessionController,
    pub connector: MockConnector,
    pub device: MockDevice,
    pub sink: MockSink,
}

pub fn session_config() -> SessionConfig {
    SessionConfig {
        transcript_base_url: TRANSCRIPT_BASE.to_string(),
        ..SessionConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(
        session_config(),
        MockDevice::new(),
        MockSink::new(),
        Arc::new(StaticProvisioner::new(CALL_URL)),
    )
}

pub fn harness_with(
    config: SessionConfig,
    device: MockDevice,
    sink: MockSink,
    provisioner: Arc<dyn Provisioner>,
) -> Harness {
    let connector = MockConnector::new();
    let controller = SessionController::new(
        config,
        provisioner,
        Arc::new(connector.clone()),
        Box::new(device.clone()),
        Arc::new(sink.clone()),
    );

    Harness {
        controller,
        connector,
        device,
        sink,
    }
}

/// Handle internal events until `done` holds
pub async fn step_until<F>(controller: &mut SessionController, mut done: F)
where
    F: FnMut(&SessionController) -> bool,
{
    for _ in 0..100 {
        if done(controller) {
            return;
        }
        tokio::time::timeout(Duration::from_secs(5), controller.step())
            .await
            .expect("timed out waiting for a session event");
    }
    assert!(done(controller), "condition not reached after 100 events");
}

/// Handle everything already queued, then return once the loop goes quiet
pub async fn drain(controller: &mut SessionController) {
    while let Ok(true) = tokio::time::timeout(Duration::from_millis(100), controller.step()).await {}
}

/// Start a call and bring it to Active with the given backend session id
pub async fn activate(h: &mut Harness, session_id: &str) -> ServerHandle {
    h.controller.start_call().await.expect("call should start");
    let server = h.connector.call_server();
    server.push_json(serde_json::json!({"type": "session_id", "session_id": session_id}));
    step_until(&mut h.controller, |c| c.state() == voice_session::CallState::Active).await;
    server
}
