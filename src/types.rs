//! Request, result, chunk and state types shared across the crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which outputs a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Text,
    #[default]
    TextAndAudio,
}

impl Modality {
    pub fn wants_audio(self) -> bool {
        matches!(self, Self::TextAndAudio)
    }
}

/// Encoded image handed to the remote analyzer as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub bytes: Vec<u8>,
    pub mime: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub image: Option<ImagePayload>,
    pub modality: Modality,
}

impl GenerationRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image: None,
            modality: Modality::Text,
        }
    }

    pub fn speech(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image: None,
            modality: Modality::TextAndAudio,
        }
    }

    pub fn with_image(mut self, image: ImagePayload) -> Self {
        self.image = Some(image);
        self
    }

    pub fn wants_audio(&self) -> bool {
        self.modality.wants_audio()
    }
}

/// One unit of streamed audio: mono samples normalized to [-1, 1].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AudioChunk {
    pub samples: Vec<f32>,
    pub end_of_stream: bool,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>) -> Self {
        Self {
            samples,
            end_of_stream: false,
        }
    }

    pub fn end_of_stream() -> Self {
        Self {
            samples: Vec::new(),
            end_of_stream: true,
        }
    }

    /// An empty chunk also terminates the stream.
    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream || self.samples.is_empty()
    }
}

/// Audio produced by the remote backend.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteAudio {
    /// Raw PCM already converted to normalized samples.
    Pcm { samples: Vec<f32>, sample_rate: u32 },
    /// A resource the caller fetches and decodes itself.
    Resource { uri: String, mime: String },
}

/// Where the audio of a finished generation went.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AudioRef {
    /// Streamed chunk by chunk through the sink and the audio event stream.
    Inline {
        chunks: usize,
        samples: usize,
        sample_rate: u32,
    },
    /// Descriptor of audio hosted by the remote backend.
    Remote { uri: String, mime: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    pub text: String,
    pub audio: Option<AudioRef>,
    /// Mode that actually served the request.
    pub served_by: ServiceMode,
}

/// Execution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    Local,
    Cloud,
    #[default]
    Hybrid,
}

impl ServiceMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "cloud" | "remote" => Some(Self::Cloud),
            "hybrid" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "LOCAL"),
            Self::Cloud => write!(f, "CLOUD"),
            Self::Hybrid => write!(f, "HYBRID"),
        }
    }
}

/// Lifecycle of an inference session. `Released` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    Loading,
    Ready,
    Generating,
    Released,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unloaded => write!(f, "UNLOADED"),
            Self::Loading => write!(f, "LOADING"),
            Self::Ready => write!(f, "READY"),
            Self::Generating => write!(f, "GENERATING"),
            Self::Released => write!(f, "RELEASED"),
        }
    }
}

/// Published orchestrator status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Initializing,
    Ready(ServiceMode),
    Generating,
    Error(String),
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Initializing => write!(f, "INITIALIZING"),
            Self::Ready(mode) => write!(f, "READY({mode})"),
            Self::Generating => write!(f, "GENERATING"),
            Self::Error(reason) => write!(f, "ERROR({reason})"),
        }
    }
}
