pub mod connection;
pub mod messages;

pub use connection::{
    forward_events, CallConnection, Connector, EventStream, MessageSink, TransportEvent,
    WsConnector,
};
pub use messages::{CallStatus, FeedMessage, InboundMessage, OutboundMessage, TranscriptPayload};
