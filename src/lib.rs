//! voice-relay: prompt-to-speech with on-device inference and remote fallback.
//!
//! A [`context::VoiceContext`] owns one pipeline: the native
//! [`session::InferenceSession`], the [`sink::StreamingAudioSink`] playback
//! queue, a [`remote::RemoteBackend`] and the
//! [`orchestrator::GenerationOrchestrator`] that routes each request.

pub mod api;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod remote;
pub mod session;
pub mod sink;
pub mod types;

pub use context::{Collaborators, VoiceContext};
pub use error::{RemoteError, RemoteErrorKind, Result, VoiceError};
pub use orchestrator::GenerationOrchestrator;
pub use types::{
    AudioChunk, AudioRef, GenerationRequest, GenerationResult, ImagePayload, Modality,
    OrchestratorState, ServiceMode,
};
