use std::pin::Pin;

use futures::stream::{SplitSink, Stream, StreamExt};
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::messages::OutboundMessage;
use crate::error::SessionError;

/// What a connection's read half produces
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Text(String),
    /// Orderly or abrupt close; the stream ends after this
    Closed { code: Option<u16> },
    /// Socket error; the stream ends after this
    Failed(String),
}

impl TransportEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransportEvent::Text(_))
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = TransportEvent> + Send>>;

/// Write half of a connection
#[async_trait::async_trait]
pub trait MessageSink: Send {
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), SessionError>;

    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Opens the call connection and the transcript feed
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Open a two-way connection
    async fn open_duplex(
        &self,
        url: &str,
    ) -> Result<(Box<dyn MessageSink>, EventStream), SessionError>;

    /// Open a receive-only connection
    async fn open_stream(&self, url: &str) -> Result<EventStream, SessionError> {
        let (_sink, stream) = self.open_duplex(url).await?;
        Ok(stream)
    }
}

/// Forward a connection's events until it closes.
///
/// Exactly one terminal event is delivered even if the stream just ends.
pub fn forward_events<E, F>(mut stream: EventStream, events: mpsc::Sender<E>, wrap: F) -> JoinHandle<()>
where
    E: Send + 'static,
    F: Fn(TransportEvent) -> E + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = stream.next().await {
            let terminal = event.is_terminal();
            if events.send(wrap(event)).await.is_err() || terminal {
                return;
            }
        }
        let _ = events.send(wrap(TransportEvent::Closed { code: None })).await;
    })
}

/// Typed wrapper around the call connection's write half
pub struct CallConnection {
    sink: Box<dyn MessageSink>,
    url: String,
    audio_frames: u64,
    closed: bool,
    remote_closed: bool,
}

impl CallConnection {
    pub fn new(sink: Box<dyn MessageSink>, url: impl Into<String>) -> Self {
        Self {
            sink,
            url: url.into(),
            audio_frames: 0,
            closed: false,
            remote_closed: false,
        }
    }

    /// Whether messages can still be sent
    pub fn is_open(&self) -> bool {
        !self.closed && !self.remote_closed
    }

    /// The peer closed the connection or it broke
    pub fn mark_closed(&mut self) {
        self.remote_closed = true;
    }

    pub async fn send_handshake(&mut self, sample_rate: u32, tts_provider: &str) -> Result<(), SessionError> {
        info!(
            "Sending handshake to {} ({}Hz pcm16, tts={})",
            self.url, sample_rate, tts_provider
        );
        self.send(&OutboundMessage::handshake(sample_rate, tts_provider))
            .await
    }

    pub async fn send_audio(&mut self, data: String) -> Result<(), SessionError> {
        self.send(&OutboundMessage::Audio { data }).await?;
        self.audio_frames += 1;
        if self.audio_frames % 100 == 0 {
            debug!("Sent {} audio frames", self.audio_frames);
        }
        Ok(())
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), SessionError> {
        info!("Sending user text ({} chars)", text.len());
        self.send(&OutboundMessage::UserText {
            text: text.to_string(),
        })
        .await
    }

    pub async fn send_end(&mut self) -> Result<(), SessionError> {
        info!("Sending end_conversation");
        self.send(&OutboundMessage::EndConversation).await
    }

    /// Close the connection. Only the first call does anything.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        info!("Closing call connection ({} audio frames sent)", self.audio_frames);
        if self.remote_closed {
            return Ok(());
        }
        self.sink.close().await
    }

    pub fn audio_frames(&self) -> u64 {
        self.audio_frames
    }

    async fn send(&mut self, message: &OutboundMessage) -> Result<(), SessionError> {
        if !self.is_open() {
            return Err(SessionError::Transport(format!(
                "cannot send {}: connection closed",
                message.kind()
            )));
        }
        self.sink.send(message).await
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector (tokio-tungstenite)
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn open_duplex(
        &self,
        url: &str,
    ) -> Result<(Box<dyn MessageSink>, EventStream), SessionError> {
        info!("Connecting to {}", url);

        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| SessionError::Transport(format!("connect to {} failed: {}", url, e)))?;

        info!("Connected to {}", url);

        let (sink, stream) = ws.split();
        let events = stream.filter_map(|message| async move { classify(message) });

        Ok((Box::new(WsMessageSink { inner: sink }), Box::pin(events)))
    }
}

struct WsMessageSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait::async_trait]
impl MessageSink for WsMessageSink {
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), SessionError> {
        let json = serde_json::to_string(message)
            .map_err(|e| SessionError::Protocol(format!("encode {}: {}", message.kind(), e)))?;

        self.inner
            .send(Message::Text(json))
            .await
            .map_err(|e| SessionError::Transport(format!("send {} failed: {}", message.kind(), e)))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        self.inner
            .close()
            .await
            .map_err(|e| SessionError::Transport(format!("close failed: {}", e)))
    }
}

fn classify(message: Result<Message, tungstenite::Error>) -> Option<TransportEvent> {
    match message {
        Ok(Message::Text(text)) => Some(TransportEvent::Text(text)),
        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
            Ok(text) => Some(TransportEvent::Text(text)),
            Err(_) => {
                warn!("Dropping non-UTF-8 binary frame");
                None
            }
        },
        Ok(Message::Close(frame)) => Some(TransportEvent::Closed {
            code: frame.map(|f| u16::from(f.code)),
        }),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => None,
        Err(tungstenite::Error::ConnectionClosed)
        | Err(tungstenite::Error::AlreadyClosed)
        | Err(tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake)) => {
            Some(TransportEvent::Closed { code: None })
        }
        Err(e) => Some(TransportEvent::Failed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_close_code() {
        let frame = tungstenite::protocol::CloseFrame {
            code: tungstenite::protocol::frame::coding::CloseCode::Away,
            reason: "bye".into(),
        };
        assert_eq!(
            classify(Ok(Message::Close(Some(frame)))),
            Some(TransportEvent::Closed { code: Some(1001) })
        );
    }

    #[test]
    fn test_classify_reset_is_close() {
        let err = tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake);
        assert_eq!(classify(Err(err)), Some(TransportEvent::Closed { code: None }));
    }

    #[test]
    fn test_classify_ping_dropped() {
        assert_eq!(classify(Ok(Message::Ping(vec![1, 2]))), None);
    }
}
