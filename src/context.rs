//! Owning scope for one voice pipeline.
//!
//! Built once at startup and handed to consumers (CLI, HTTP API). Dropping
//! the context or calling `shutdown()` tears everything down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::device::{DeviceCapabilityProbe, SystemProbe};
use crate::error::{Result, VoiceError};
use crate::orchestrator::{GenerationOrchestrator, OrchestratorSettings};
use crate::remote::{OllamaBackend, RemoteBackend};
use crate::session::kokoro::KokoroBinding;
use crate::session::{InferenceSession, NativeEngineBinding};
use crate::sink::{AudioOutput, RodioOutput, StreamingAudioSink};
use crate::types::{GenerationRequest, GenerationResult};

/// External collaborators the pipeline is assembled from.
pub struct Collaborators {
    pub binding: Arc<dyn NativeEngineBinding>,
    pub output: Arc<dyn AudioOutput>,
    pub remote: Arc<dyn RemoteBackend>,
    pub probe: Arc<dyn DeviceCapabilityProbe>,
}

impl Collaborators {
    /// Kokoro on ONNX Runtime, rodio playback, Ollama over HTTP, /proc probe.
    pub fn system(config: &Config) -> Result<Self> {
        let remote = OllamaBackend::new(config.remote.clone()).map_err(VoiceError::Configuration)?;
        Ok(Self {
            binding: Arc::new(KokoroBinding::new(config.session.threads)),
            output: Arc::new(RodioOutput::new(config.sink.buffer_ms)),
            remote: Arc::new(remote),
            probe: Arc::new(SystemProbe::new(config.device.clone())),
        })
    }
}

pub struct VoiceContext {
    config: Config,
    orchestrator: Arc<GenerationOrchestrator>,
    session: Arc<InferenceSession>,
    sink: Arc<StreamingAudioSink>,
    closed: AtomicBool,
}

impl VoiceContext {
    /// Assemble the pipeline and run orchestrator initialization.
    pub async fn init(config: Config, collaborators: Collaborators) -> Result<Self> {
        let sink = Arc::new(StreamingAudioSink::new(&config.sink, collaborators.output));
        let session = Arc::new(InferenceSession::new(
            collaborators.binding,
            config.session.clone(),
        ));
        let orchestrator = Arc::new(
            GenerationOrchestrator::new(
                collaborators.remote,
                collaborators.probe,
                OrchestratorSettings::from_config(&config),
            )
            .with_session(Arc::clone(&session))
            .with_sink(Arc::clone(&sink)),
        );

        if config.session.audio_enabled && !sink.start() {
            warn!("No playback device, audio is only published on the event stream");
        }

        if let Err(e) = orchestrator.initialize().await {
            orchestrator.shutdown();
            return Err(e);
        }

        info!(
            "Voice context ready (mode={})",
            orchestrator
                .effective_mode()
                .map(|m| m.to_string())
                .unwrap_or_else(|| "-".into())
        );

        Ok(Self {
            config,
            orchestrator,
            session,
            sink,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<GenerationOrchestrator> {
        &self.orchestrator
    }

    pub fn session(&self) -> &Arc<InferenceSession> {
        &self.session
    }

    pub fn sink(&self) -> &Arc<StreamingAudioSink> {
        &self.sink
    }

    pub async fn produce_voice(&self, request: GenerationRequest) -> Result<GenerationResult> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VoiceError::ResourceReleased);
        }
        self.orchestrator.produce_voice(request).await
    }

    /// Cancel in-flight work, stop playback and free the engine. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.orchestrator.shutdown();
        info!("Voice context shut down");
    }
}

impl Drop for VoiceContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
