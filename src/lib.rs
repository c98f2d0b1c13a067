pub mod audio;
pub mod config;
pub mod control;
pub mod error;
pub mod protocol;
pub mod provisioning;
pub mod session;
pub mod transcript;

pub use audio::{
    AudioDeviceFactory, AudioFrame, AudioSink, CaptureConstraints, CaptureDevice, CaptureSource,
    CapturePipeline, PlaybackQueue, PlaybackTarget, Player,
};
pub use config::Config;
pub use control::{ControlDecision, ControlSignal};
pub use error::{CodecError, SessionError};
pub use protocol::{Connector, InboundMessage, OutboundMessage, WsConnector};
pub use provisioning::{HttpProvisioner, Provisioner, StaticProvisioner};
pub use session::{
    CallSession, CallState, SessionConfig, SessionController, SessionStats, SessionUpdate,
    UserCommand,
};
pub use transcript::{Speaker, TranscriptEntry, TranscriptSynchronizer};
