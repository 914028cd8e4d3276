//! Error taxonomy shared by the session, sink, orchestrator and remote backend.

use std::fmt;

/// Failure categories a remote backend can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    Unauthorized,
    RateLimited,
    Network,
    ServerError,
    Malformed,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::RateLimited => write!(f, "rate limited"),
            Self::Network => write!(f, "network"),
            Self::ServerError => write!(f, "server error"),
            Self::Malformed => write!(f, "malformed response"),
        }
    }
}

/// A failed remote call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VoiceError {
    /// Missing key, model path, or unconfigured backend.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The single-flight gate (or the session itself) is already busy.
    #[error("another generation is already in progress")]
    ConcurrencyRejected,
    /// Engine load or playback device acquisition failed.
    #[error("resource unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("remote backend error ({0})")]
    Remote(#[from] RemoteError),
    /// Operation attempted after teardown.
    #[error("resource already released")]
    ResourceReleased,
    /// A failure raised inside local generation, caught at the session boundary.
    #[error("generation failed: {0}")]
    GenerationFailed(String),
}

impl VoiceError {
    /// Human-readable reason published in `OrchestratorState::Error`.
    pub fn reason(&self) -> String {
        self.to_string()
    }

    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            Self::Remote(e) => Some(e.kind),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
