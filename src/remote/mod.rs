//! Remote backend contract consumed by the orchestrator.
//!
//! Transport, wire format and retry policy belong to the implementation;
//! the orchestrator adds no retries of its own beyond the hybrid fallback.

pub mod ollama;
#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::types::{ImagePayload, RemoteAudio};

pub use ollama::OllamaBackend;

/// Text plus optional audio returned by a remote voice generation.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteVoice {
    pub text: String,
    pub audio: Option<RemoteAudio>,
}

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Describe `image` guided by `prompt`.
    async fn analyze_image(&self, image: &ImagePayload, prompt: &str) -> Result<String, RemoteError>;

    async fn generate_voice(&self, text: &str, want_audio: bool) -> Result<RemoteVoice, RemoteError>;

    /// False when credentials or endpoints are missing. Never touches the network.
    fn is_configured(&self) -> bool;
}
