use thiserror::Error;

/// Failures that can end a call attempt.
///
/// Resource-acquisition errors (`Provisioning`, `Device`) surface immediately and
/// block progress. `Transport` is fatal while connecting; once a call is active the
/// controller decides case by case. `Protocol` is always absorbed per message.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    #[error("audio device unavailable: {0}")]
    Device(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("malformed message: {0}")]
    Protocol(String),
}

impl SessionError {
    /// Whether the user may simply press "call" again.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SessionError::Protocol(_))
    }
}

/// Frame decode failures. Callers drop the frame and keep going.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame is not valid base64: {0}")]
    Encoding(String),

    #[error("frame has odd byte length {0}")]
    OddLength(usize),
}
