use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::config::SessionConfig;
use super::events::{EventKind, SessionEvent, SessionUpdate, TranscriptStatus, UserCommand};
use super::state::{CallSession, CallState};
use super::stats::SessionStats;
use crate::audio::{AudioFrame, AudioSink, CaptureDevice, CapturePipeline, Player};
use crate::control::{self, ControlDecision, ControlSignal};
use crate::error::SessionError;
use crate::protocol::{
    forward_events, CallConnection, CallStatus, Connector, FeedMessage, InboundMessage,
    TransportEvent,
};
use crate::provisioning::Provisioner;
use crate::transcript::{
    transcript_url, FeedEvent, SyncOutcome, TranscriptEntry, TranscriptFeed, TranscriptSource,
    TranscriptSynchronizer,
};

const EVENT_QUEUE: usize = 256;

/// Availability lookups arrive as a function result with this name
const CHECK_AVAILABILITY: &str = "check_availability";

/// Drives one voice call at a time
///
/// The controller is the only owner of the call connection, the capture
/// pipeline, the playback queue and the transcript. Everything else talks to it
/// through [`SessionEvent`]s, so all state changes happen in one place, one
/// event at a time.
pub struct SessionController {
    config: SessionConfig,
    provisioner: Arc<dyn Provisioner>,
    connector: Arc<dyn Connector>,

    call: CallSession,
    /// Bumped on every start and teardown; stale events are discarded
    epoch: u64,

    capture: CapturePipeline,
    player: Player<SessionEvent>,
    transcript: TranscriptSynchronizer,

    connection: Option<CallConnection>,
    reader: Option<JoinHandle<()>>,
    feed: Option<TranscriptFeed>,

    availability: Option<Value>,
    booking: Option<Value>,
    agent_speaking: bool,
    user_speaking: bool,

    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Option<mpsc::Receiver<SessionEvent>>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        provisioner: Arc<dyn Provisioner>,
        connector: Arc<dyn Connector>,
        device: Box<dyn CaptureDevice>,
        sink: Arc<dyn AudioSink>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (updates, _) = broadcast::channel(config.update_capacity.max(1));

        Self {
            capture: CapturePipeline::new(device, config.constraints.clone()),
            player: Player::new(sink),
            transcript: TranscriptSynchronizer::new(config.fallback_extraction),
            config,
            provisioner,
            connector,
            call: CallSession::new(),
            epoch: 0,
            connection: None,
            reader: None,
            feed: None,
            availability: None,
            booking: None,
            agent_speaking: false,
            user_speaking: false,
            events_tx,
            events_rx: Some(events_rx),
            updates,
        }
    }

    /// Receive UI updates
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    pub fn state(&self) -> CallState {
        self.call.state
    }

    pub fn session(&self) -> &CallSession {
        &self.call
    }

    pub fn is_interacting(&self) -> bool {
        self.capture.is_interacting()
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_running()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn has_transcript_feed(&self) -> bool {
        self.feed.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.player.is_playing()
    }

    pub fn queued_audio(&self) -> usize {
        self.player.queued()
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        self.transcript.entries()
    }

    pub fn interim_entries(&self) -> Vec<&TranscriptEntry> {
        self.transcript.interims()
    }

    pub fn availability(&self) -> Option<&Value> {
        self.availability.as_ref()
    }

    pub fn booking(&self) -> Option<&Value> {
        self.booking.as_ref()
    }

    pub fn agent_speaking(&self) -> bool {
        self.agent_speaking
    }

    pub fn user_speaking(&self) -> bool {
        self.user_speaking
    }

    /// Start a call: provision, acquire the microphone, connect, handshake.
    ///
    /// A call that is already connecting or active is left alone. After an
    /// ended or failed call the controller goes back to idle first.
    pub async fn start_call(&mut self) -> Result<(), SessionError> {
        match self.call.state {
            CallState::Connecting | CallState::Active => {
                warn!("[{}] Call already in progress", self.call.local_id);
                return Ok(());
            }
            CallState::Ended | CallState::Error => self.set_state(CallState::Idle),
            CallState::Idle => {}
        }

        self.call = CallSession::new();
        self.epoch += 1;
        info!("[{}] Starting call", self.call.local_id);
        self.set_state(CallState::Connecting);

        match self.connect().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    /// User hangs up. Safe to call in any state, any number of times.
    pub async fn end_call(&mut self) -> SessionStats {
        let stats = self.stats();

        if self.call.state.is_live() {
            info!("[{}] Ending call", self.call.local_id);
            self.send_end().await;
            self.teardown().await;
            self.set_state(CallState::Ended);
        } else {
            debug!("No live call to end (state={:?})", self.call.state);
            self.teardown().await;
        }

        stats
    }

    /// Send typed text as an alternative to speech
    pub async fn send_text(&mut self, text: &str) -> Result<(), SessionError> {
        if self.call.state != CallState::Active {
            return Err(SessionError::Transport(format!(
                "cannot send text while {:?}",
                self.call.state
            )));
        }

        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| SessionError::Transport("no call connection".to_string()))?;

        connection.send_text(text).await
    }

    pub fn stats(&self) -> SessionStats {
        // A finished call stops the clock
        let until = self.call.ended_at.unwrap_or_else(Utc::now);
        let duration_secs = self
            .call
            .started_at
            .map(|t| until.signed_duration_since(t).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);

        SessionStats {
            state: self.call.state,
            session_id: self.call.id.clone(),
            started_at: self.call.started_at,
            ended_at: self.call.ended_at,
            duration_secs,
            interacting: self.capture.is_interacting(),
            frames_sent: self.capture.frames_sent(),
            frames_dropped: self.capture.frames_dropped(),
            playback_units_played: self.player.played(),
            transcript_entries: self.transcript.len(),
        }
    }

    /// Wait for the next internal event and handle it.
    ///
    /// Returns false once no more events can arrive.
    pub async fn step(&mut self) -> bool {
        let event = match self.events_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        };

        match event {
            Some(event) => {
                self.handle_event(event).await;
                true
            }
            None => false,
        }
    }

    /// Event loop: user commands plus internal events until shutdown.
    ///
    /// Ends any live call on the way out and releases the audio output.
    pub async fn run(mut self, mut commands: mpsc::Receiver<UserCommand>) -> SessionStats {
        let Some(mut events) = self.events_rx.take() else {
            error!("Session event loop already running");
            return self.stats();
        };

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(UserCommand::Start) => {
                        if let Err(e) = self.start_call().await {
                            warn!("Call failed to start: {}", e);
                        }
                    }
                    Some(UserCommand::End) => {
                        self.end_call().await;
                    }
                    Some(UserCommand::SendText(text)) => {
                        if let Err(e) = self.send_text(&text).await {
                            warn!("Failed to send text: {}", e);
                        }
                    }
                    Some(UserCommand::Shutdown) | None => break,
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }

        let stats = self.end_call().await;
        self.player.close().await;
        info!("Session event loop stopped");
        stats
    }

    pub async fn handle_event(&mut self, event: SessionEvent) {
        if event.epoch != self.epoch {
            debug!("Discarding event from call epoch {}", event.epoch);
            return;
        }

        match event.kind {
            EventKind::Captured(frame) => self.on_captured(frame).await,
            EventKind::Call(TransportEvent::Text(text)) => match InboundMessage::parse(&text) {
                Ok(message) => self.on_message(message).await,
                Err(e) => warn!("Dropping call message: {}", e),
            },
            EventKind::Call(TransportEvent::Closed { code }) => {
                if let Some(connection) = self.connection.as_mut() {
                    connection.mark_closed();
                }
                let decision = control::interpret_close(code, self.call.state);
                self.apply(decision).await;
            }
            EventKind::Call(TransportEvent::Failed(reason)) => {
                if let Some(connection) = self.connection.as_mut() {
                    connection.mark_closed();
                }
                let decision = control::interpret_failure(&reason, self.call.state);
                self.apply(decision).await;
            }
            EventKind::Feed(event) => self.on_feed(event),
            EventKind::PlaybackDone(id) => self.player.on_complete(id),
        }
    }

    async fn connect(&mut self) -> Result<(), SessionError> {
        let url = self.provisioner.provision().await?;
        let epoch = self.epoch;

        self.capture
            .start(self.events_tx.clone(), move |frame| {
                SessionEvent::new(epoch, EventKind::Captured(frame))
            })
            .await?;

        let (sink, stream) = self.connector.open_duplex(&url).await?;
        self.reader = Some(forward_events(stream, self.events_tx.clone(), move |event| {
            SessionEvent::new(epoch, EventKind::Call(event))
        }));
        self.player.attach(self.events_tx.clone(), move |id| {
            SessionEvent::new(epoch, EventKind::PlaybackDone(id))
        });

        let connection = self.connection.insert(CallConnection::new(sink, url));
        connection
            .send_handshake(self.config.sample_rate, &self.config.tts_provider)
            .await
    }

    async fn on_captured(&mut self, frame: AudioFrame) {
        let Some(data) = self.capture.process(&frame) else {
            return;
        };

        if let Some(connection) = self.connection.as_mut() {
            if !connection.is_open() {
                return;
            }
            if let Err(e) = connection.send_audio(data).await {
                warn!("Failed to send audio frame: {}", e);
            }
        }
    }

    async fn on_message(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::SessionId { session_id } => self.on_session_id(session_id),
            InboundMessage::Audio { data } => {
                if self.call.state.is_live() {
                    self.player.enqueue_frame(&data);
                }
            }
            InboundMessage::Transcript(payload) => {
                let outcome = self.transcript.ingest(&payload, TranscriptSource::Primary);
                self.publish_transcript(outcome);
            }
            InboundMessage::FunctionResult {
                function_name,
                result,
            } => {
                if function_name == CHECK_AVAILABILITY {
                    info!("Availability received");
                    self.availability = Some(result.clone());
                    self.publish(SessionUpdate::Availability { slots: result });
                } else {
                    debug!("Ignoring function result for {}", function_name);
                }
            }
            InboundMessage::BookingConfirmed { booking } => {
                info!("Booking confirmed");
                self.booking = Some(booking.clone());
                if self.availability.take().is_some() {
                    self.publish(SessionUpdate::AvailabilityCleared);
                }
                self.publish(SessionUpdate::BookingConfirmed { booking });
            }
            InboundMessage::Control { action } => {
                let signal = ControlSignal::parse(&action);
                let decision = control::interpret(&signal, self.call.state);
                self.apply(decision).await;
            }
            InboundMessage::AgentSpeaking { is_speaking } => {
                self.agent_speaking = is_speaking;
                self.publish(SessionUpdate::AgentSpeaking { is_speaking });
            }
            InboundMessage::UserSpeaking { is_speaking } => {
                self.user_speaking = is_speaking;
                self.publish(SessionUpdate::UserSpeaking { is_speaking });
            }
            InboundMessage::Unknown(value) => self.on_unrecognized(&value),
        }
    }

    fn on_session_id(&mut self, session_id: String) {
        match self.call.state {
            CallState::Connecting => {}
            CallState::Active => {
                if self.call.id.as_deref() != Some(session_id.as_str()) {
                    warn!(
                        "Ignoring second session id {} (current {:?})",
                        session_id, self.call.id
                    );
                }
                return;
            }
            state => {
                debug!("Ignoring session id while {:?}", state);
                return;
            }
        }

        info!("[{}] Backend session id {}", self.call.local_id, session_id);
        self.call.id = Some(session_id.clone());
        self.capture.set_interacting(true);
        self.set_state(CallState::Active);

        let url = transcript_url(&self.config.transcript_base_url, &session_id);
        let epoch = self.epoch;
        self.feed = Some(TranscriptFeed::spawn(
            Arc::clone(&self.connector),
            url,
            self.config.reconnect.clone(),
            self.events_tx.clone(),
            move |event| SessionEvent::new(epoch, EventKind::Feed(event)),
        ));
    }

    fn on_feed(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Connected => self.publish_feed_status(TranscriptStatus::Connected),
            FeedEvent::Reconnecting { .. } => {
                self.publish_feed_status(TranscriptStatus::Reconnecting)
            }
            FeedEvent::GaveUp { attempts } => {
                if let Some(feed) = self.feed.take() {
                    warn!(
                        "Transcript feed {} unavailable after {} attempts",
                        feed.url(),
                        attempts
                    );
                }
                self.publish_feed_status(TranscriptStatus::Error);
            }
            FeedEvent::Message(FeedMessage::Transcript(payload)) => {
                let outcome = self.transcript.ingest(&payload, TranscriptSource::Secondary);
                self.publish_transcript(outcome);
            }
            FeedEvent::Message(FeedMessage::CallStatus { status }) => {
                // Informational only; the feed never ends the call
                info!("Transcript feed reports call status {:?}", status);
                let status = match status {
                    CallStatus::Started => TranscriptStatus::Started,
                    CallStatus::Ended => TranscriptStatus::Ended,
                    CallStatus::Error => TranscriptStatus::Error,
                    CallStatus::Other => return,
                };
                self.publish_feed_status(status);
            }
            FeedEvent::Message(FeedMessage::Connected { .. }) => {
                debug!("Transcript feed handshake received");
            }
            FeedEvent::Message(FeedMessage::Unknown(value)) => self.on_unrecognized(&value),
        }
    }

    fn on_unrecognized(&mut self, value: &Value) {
        match self.transcript.ingest_unrecognized(value) {
            SyncOutcome::Ignored => {
                let kind = value.get("type").and_then(Value::as_str).unwrap_or("<none>");
                info!("Unhandled message type {}", kind);
            }
            outcome => self.publish_transcript(outcome),
        }
    }

    async fn apply(&mut self, decision: ControlDecision) {
        match decision {
            ControlDecision::Ignore => {}
            ControlDecision::Terminate => {
                if self.call.state.is_live() {
                    info!("[{}] Call terminated by backend", self.call.local_id);
                    self.send_end().await;
                    self.teardown().await;
                    self.set_state(CallState::Ended);
                }
            }
            ControlDecision::Fail(message) => {
                self.fail(&SessionError::Transport(message)).await;
            }
        }
    }

    async fn fail(&mut self, error: &SessionError) {
        error!("[{}] Call failed: {}", self.call.local_id, error);
        self.teardown().await;
        self.call.last_error = Some(error.to_string());
        self.set_state(CallState::Error);
        self.publish(SessionUpdate::Failure {
            message: error.to_string(),
            retryable: error.is_retryable(),
        });
    }

    async fn send_end(&mut self) {
        if let Some(connection) = self.connection.as_mut() {
            if !connection.is_open() {
                return;
            }
            if let Err(e) = connection.send_end().await {
                warn!("Failed to send end_conversation: {}", e);
            }
        }
    }

    /// Release every per-call resource. Idempotent.
    async fn teardown(&mut self) {
        self.epoch += 1;

        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                warn!("Failed to close call connection: {}", e);
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut feed) = self.feed.take() {
            feed.close();
        }

        self.capture.stop().await;
        self.player.flush();
        self.transcript.clear();

        self.availability = None;
        self.booking = None;
        self.agent_speaking = false;
        self.user_speaking = false;
    }

    fn set_state(&mut self, state: CallState) {
        if self.call.transition(state) {
            self.publish(SessionUpdate::StateChanged {
                state,
                session_id: self.call.id.clone(),
            });
        }
    }

    fn publish_transcript(&self, outcome: SyncOutcome) {
        match outcome {
            SyncOutcome::Appended(entry) => self.publish(SessionUpdate::Transcript { entry }),
            SyncOutcome::Interim(entry) => self.publish(SessionUpdate::Interim { entry }),
            SyncOutcome::InterimCleared(speaker)
            | SyncOutcome::Duplicate {
                cleared: Some(speaker),
                ..
            } => self.publish(SessionUpdate::InterimCleared { speaker }),
            SyncOutcome::Duplicate { cleared: None, .. } | SyncOutcome::Ignored => {}
        }
    }

    fn publish_feed_status(&self, status: TranscriptStatus) {
        self.publish(SessionUpdate::TranscriptStatus { status });
    }

    fn publish(&self, update: SessionUpdate) {
        // No subscribers is fine
        let _ = self.updates.send(update);
    }
}
