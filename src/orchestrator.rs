//! Generation orchestration with single-flight execution.
//!
//! IDLE → INITIALIZING → READY(mode) → GENERATING → READY(mode) | ERROR
//!
//! One atomic gate guards both generation and status publication: a second
//! caller never waits, it gets `ConcurrencyRejected` immediately. The
//! effective mode is resolved once per `initialize()`; in HYBRID a local
//! failure (load or generation) downgrades it to CLOUD for the rest of the
//! run, with exactly one remote attempt taking over the failed request.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::device::{DeviceCapabilityProbe, DeviceRecommendation};
use crate::error::{Result, VoiceError};
use crate::remote::{RemoteBackend, RemoteVoice};
use crate::session::InferenceSession;
use crate::sink::StreamingAudioSink;
use crate::types::{
    AudioChunk, AudioRef, GenerationRequest, GenerationResult, OrchestratorState, RemoteAudio,
    ServiceMode, SessionState,
};

/// Samples per chunk when replaying remote PCM through the sink (200ms at 24kHz).
const REMOTE_CHUNK_SAMPLES: usize = 4800;
const AUDIO_EVENT_CAPACITY: usize = 256;

/// User/device policy read at initialization time.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorSettings {
    pub preferred_mode: ServiceMode,
    pub force_remote: bool,
    pub local_model_path: Option<PathBuf>,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            preferred_mode: config.orchestrator.mode,
            force_remote: config.orchestrator.force_remote,
            local_model_path: config.session.local_model_path(),
        }
    }
}

/// Pick the execution mode for this run.
pub fn resolve_mode(settings: &OrchestratorSettings, device: &DeviceRecommendation) -> ServiceMode {
    if settings.force_remote || settings.preferred_mode == ServiceMode::Cloud {
        ServiceMode::Cloud
    } else if settings.local_model_path.is_none() && !device.is_local_recommended {
        ServiceMode::Cloud
    } else if !device.is_local_recommended {
        ServiceMode::Cloud
    } else if settings.preferred_mode == ServiceMode::Local {
        ServiceMode::Local
    } else {
        ServiceMode::Hybrid
    }
}

/// Holds the single-flight gate. On drop it releases the gate, and if the
/// holder was dropped between `begin()` and `finish()` it first publishes a
/// terminal state and cancels local work.
struct GateGuard<'a> {
    owner: &'a GenerationOrchestrator,
    in_progress: bool,
}

impl GateGuard<'_> {
    fn begin(&mut self) {
        self.in_progress = true;
    }

    fn finish(&mut self) {
        self.in_progress = false;
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        if self.in_progress {
            self.owner.abandon();
        }
        self.owner.gate.store(false, Ordering::Release);
    }
}

#[derive(Default)]
struct AudioTally {
    chunks: AtomicUsize,
    samples: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamPhase {
    Open,
    /// The engine ended the stream but the end-of-stream was withheld.
    Held,
    Closed,
}

/// Audio from one local generation on its way to the sink and the event
/// stream. With `hold_end` the engine's end-of-stream is withheld until the
/// outcome is known, so a fallback can continue the same stream.
struct LocalStream {
    sink: Option<Arc<StreamingAudioSink>>,
    events: broadcast::Sender<AudioChunk>,
    tally: AudioTally,
    hold_end: bool,
    phase: Mutex<StreamPhase>,
}

impl LocalStream {
    fn phase(&self) -> MutexGuard<'_, StreamPhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn chunks(&self) -> usize {
        self.tally.chunks.load(Ordering::SeqCst)
    }

    /// Engine callback. Chunks arriving after the stream closed are discarded.
    fn emit(&self, chunk: AudioChunk) {
        let mut phase = self.phase();
        if *phase == StreamPhase::Closed {
            return;
        }
        let end = chunk.is_end_of_stream();
        if end && self.hold_end {
            *phase = StreamPhase::Held;
            return;
        }
        deliver_chunk(self.sink.as_deref(), &self.events, &self.tally, chunk);
        if end {
            *phase = StreamPhase::Closed;
        }
    }

    /// End the stream if it still owes an end-of-stream. Idempotent.
    fn finish(&self, succeeded: bool) {
        let mut phase = self.phase();
        let owes_end = match *phase {
            StreamPhase::Closed => false,
            StreamPhase::Held => succeeded || self.chunks() > 0,
            StreamPhase::Open => self.chunks() > 0,
        };
        if owes_end {
            deliver_chunk(
                self.sink.as_deref(),
                &self.events,
                &AudioTally::default(),
                AudioChunk::end_of_stream(),
            );
        }
        *phase = StreamPhase::Closed;
    }

    /// The remote answer carries its own end-of-stream.
    fn hand_over(&self) {
        *self.phase() = StreamPhase::Closed;
    }
}

/// Finishes a local stream on every exit path, including a dropped request.
struct StreamGuard(Arc<LocalStream>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.finish(false);
    }
}

pub struct GenerationOrchestrator {
    session: Option<Arc<InferenceSession>>,
    remote: Arc<dyn RemoteBackend>,
    probe: Arc<dyn DeviceCapabilityProbe>,
    sink: Option<Arc<StreamingAudioSink>>,
    settings: Mutex<OrchestratorSettings>,
    /// Effective mode; `None` until initialized.
    mode: Mutex<Option<ServiceMode>>,
    gate: AtomicBool,
    status: watch::Sender<OrchestratorState>,
    audio_events: broadcast::Sender<AudioChunk>,
    shutdown: CancellationToken,
}

impl GenerationOrchestrator {
    pub fn new(
        remote: Arc<dyn RemoteBackend>,
        probe: Arc<dyn DeviceCapabilityProbe>,
        settings: OrchestratorSettings,
    ) -> Self {
        let (status, _) = watch::channel(OrchestratorState::Idle);
        let (audio_events, _) = broadcast::channel(AUDIO_EVENT_CAPACITY);
        Self {
            session: None,
            remote,
            probe,
            sink: None,
            settings: Mutex::new(settings),
            mode: Mutex::new(None),
            gate: AtomicBool::new(false),
            status,
            audio_events,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_session(mut self, session: Arc<InferenceSession>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_sink(mut self, sink: Arc<StreamingAudioSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn settings(&self) -> MutexGuard<'_, OrchestratorSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mode_slot(&self) -> MutexGuard<'_, Option<ServiceMode>> {
        self.mode.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Configuration (applies at the next initialize) ---

    pub fn set_service_mode(&self, mode: ServiceMode) {
        self.settings().preferred_mode = mode;
    }

    pub fn set_force_remote(&self, force: bool) {
        self.settings().force_remote = force;
    }

    pub fn set_local_model_path(&self, path: Option<PathBuf>) {
        self.settings().local_model_path = path;
    }

    // --- Observation ---

    pub fn effective_mode(&self) -> Option<ServiceMode> {
        *self.mode_slot()
    }

    pub fn state(&self) -> OrchestratorState {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<OrchestratorState> {
        self.status.subscribe()
    }

    pub fn subscribe_audio(&self) -> broadcast::Receiver<AudioChunk> {
        self.audio_events.subscribe()
    }

    pub fn session(&self) -> Option<&Arc<InferenceSession>> {
        self.session.as_ref()
    }

    pub fn is_busy(&self) -> bool {
        self.gate.load(Ordering::Acquire)
    }

    fn try_acquire(&self) -> Option<GateGuard<'_>> {
        self.gate
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GateGuard {
                owner: self,
                in_progress: false,
            })
    }

    /// The request holding the gate was dropped before it finished.
    fn abandon(&self) {
        warn!("Request dropped before completion");
        if let Some(session) = &self.session {
            session.cancel();
        }
        self.publish(OrchestratorState::Error("request cancelled".into()));
    }

    /// Only called while holding the gate.
    fn publish(&self, state: OrchestratorState) {
        let previous = self.status.send_replace(state.clone());
        if previous != state {
            info!("State: {previous} → {state}");
        }
    }

    // --- Lifecycle ---

    /// Resolve the execution mode and load the local engine if it will be used.
    pub async fn initialize(&self) -> Result<ServiceMode> {
        let Some(mut gate) = self.try_acquire() else {
            return Err(VoiceError::ConcurrencyRejected);
        };
        if self.shutdown.is_cancelled() {
            return Err(VoiceError::ResourceReleased);
        }

        self.publish(OrchestratorState::Initializing);
        gate.begin();
        let outcome = self.initialize_inner().await;
        match &outcome {
            Ok(mode) => self.publish(OrchestratorState::Ready(*mode)),
            Err(e) => {
                warn!("Initialization failed: {e}");
                self.publish(OrchestratorState::Error(e.reason()));
            }
        }
        gate.finish();
        outcome
    }

    async fn initialize_inner(&self) -> Result<ServiceMode> {
        let settings = self.settings().clone();
        let device = self.probe.recommend();
        let mut mode = resolve_mode(&settings, &device);
        info!("Resolved mode {mode}: {}", device.reason);

        if mode != ServiceMode::Cloud {
            match (&settings.local_model_path, &self.session) {
                (Some(path), Some(session)) => {
                    let session = Arc::clone(session);
                    let path = path.clone();
                    let loaded = tokio::task::spawn_blocking(move || session.load(&path))
                        .await
                        .map_err(|e| {
                            VoiceError::ResourceUnavailable(format!("load task failed: {e}"))
                        })
                        .and_then(|r| r);

                    if let Err(e) = loaded {
                        if mode != ServiceMode::Hybrid {
                            return Err(e);
                        }
                        if !self.remote.is_configured() {
                            return Err(VoiceError::Configuration(format!(
                                "local engine unavailable ({e}) and remote backend is not configured"
                            )));
                        }
                        warn!("Local engine failed to load ({e}), continuing in CLOUD mode");
                        mode = ServiceMode::Cloud;
                    }
                }
                (None, _) if mode == ServiceMode::Local => {
                    return Err(VoiceError::Configuration(
                        "local mode requires a model path".into(),
                    ));
                }
                (Some(_), None) if mode == ServiceMode::Local => {
                    return Err(VoiceError::Configuration(
                        "local mode requires an inference session".into(),
                    ));
                }
                _ => debug!("No local model, {mode} requests will use the remote backend"),
            }
        }

        if mode == ServiceMode::Cloud && !self.remote.is_configured() {
            warn!("Remote backend is not configured, requests will fail until it is");
        }

        *self.mode_slot() = Some(mode);
        Ok(mode)
    }

    /// Cancel in-flight work and release the sink and the native engine.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Orchestrator shutting down");
            self.shutdown.cancel();
        }
        if let Some(sink) = &self.sink {
            sink.release();
        }
        if let Some(session) = &self.session {
            session.release();
        }
    }

    // --- Generation ---

    /// Serve one request. Never blocks on another request: if one is in
    /// flight this returns `ConcurrencyRejected` immediately.
    ///
    /// Dropping the returned future mid-request publishes `Error` and asks the
    /// local engine to stop. Until it does, further requests are rejected.
    pub async fn produce_voice(&self, request: GenerationRequest) -> Result<GenerationResult> {
        let Some(mut gate) = self.try_acquire() else {
            debug!("Generation rejected: another request is in flight");
            return Err(VoiceError::ConcurrencyRejected);
        };
        if self.shutdown.is_cancelled() {
            return Err(VoiceError::ResourceReleased);
        }

        let Some(mode) = self.effective_mode() else {
            let err = VoiceError::Configuration("orchestrator is not initialized".into());
            self.publish(OrchestratorState::Error(err.reason()));
            return Err(err);
        };
        if mode != ServiceMode::Cloud
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.state() == SessionState::Generating)
        {
            debug!("Generation rejected: the local engine is still stopping a dropped request");
            return Err(VoiceError::ConcurrencyRejected);
        }

        self.publish(OrchestratorState::Generating);
        gate.begin();
        let t0 = Instant::now();

        let outcome = tokio::select! {
            outcome = self.dispatch(mode, &request) => outcome,
            _ = self.shutdown.cancelled() => Err(VoiceError::ResourceReleased),
        };

        match &outcome {
            Ok(result) => {
                info!(
                    "Generation complete via {}: {} chars, audio={} ({:.0}ms)",
                    result.served_by,
                    result.text.len(),
                    result.audio.is_some(),
                    t0.elapsed().as_secs_f64() * 1000.0
                );
                let mode = self.effective_mode().unwrap_or(mode);
                self.publish(OrchestratorState::Ready(mode));
            }
            Err(e) => {
                warn!("Generation failed: {e}");
                self.publish(OrchestratorState::Error(e.reason()));
            }
        }
        gate.finish();
        outcome
    }

    async fn dispatch(&self, mode: ServiceMode, request: &GenerationRequest) -> Result<GenerationResult> {
        match mode {
            ServiceMode::Cloud => {
                self.ensure_remote_configured()?;
                let analysis = self.analyze_if_needed(request).await?;
                self.run_remote(request, analysis.as_deref()).await
            }
            ServiceMode::Local => {
                let analysis = self.analyze_if_needed(request).await?;
                let stream = self.open_local_stream(false);
                self.run_local(request, analysis.as_deref(), &stream.0).await
            }
            ServiceMode::Hybrid => self.run_hybrid(request).await,
        }
    }

    async fn run_hybrid(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let analysis = self.analyze_if_needed(request).await?;

        let local_ready = self.session.as_ref().is_some_and(|s| s.is_loaded());
        if !local_ready {
            self.ensure_remote_configured()?;
            return self.run_remote(request, analysis.as_deref()).await;
        }

        // The local end-of-stream is held back so a failed attempt does not
        // close the stream the fallback is about to continue.
        let stream = self.open_local_stream(true);
        match self.run_local(request, analysis.as_deref(), &stream.0).await {
            Ok(result) => Ok(result),
            // Not local failures: teardown, or a dropped request still unwinding.
            Err(e @ (VoiceError::ResourceReleased | VoiceError::ConcurrencyRejected)) => Err(e),
            Err(e) => {
                warn!("Local generation failed ({e}), falling back to CLOUD for this run");
                *self.mode_slot() = Some(ServiceMode::Cloud);
                self.ensure_remote_configured()?;
                let voice = self.fetch_remote(request, analysis.as_deref()).await?;
                if voice_streams(request, &voice) {
                    stream.0.hand_over();
                }
                Ok(self.deliver_remote(request, voice))
            }
        }
    }

    fn open_local_stream(&self, hold_end: bool) -> StreamGuard {
        StreamGuard(Arc::new(LocalStream {
            sink: self.sink.clone(),
            events: self.audio_events.clone(),
            tally: AudioTally::default(),
            hold_end,
            phase: Mutex::new(StreamPhase::Open),
        }))
    }

    fn ensure_remote_configured(&self) -> Result<()> {
        if self.remote.is_configured() {
            Ok(())
        } else {
            Err(VoiceError::Configuration(
                "remote backend is not configured".into(),
            ))
        }
    }

    /// Image analysis always goes to the remote backend.
    async fn analyze_if_needed(&self, request: &GenerationRequest) -> Result<Option<String>> {
        let Some(image) = &request.image else {
            return Ok(None);
        };
        self.ensure_remote_configured()?;
        let analysis = self.remote.analyze_image(image, &request.prompt).await?;
        debug!("Image analysis: {analysis}");
        Ok(Some(analysis))
    }

    async fn run_remote(
        &self,
        request: &GenerationRequest,
        analysis: Option<&str>,
    ) -> Result<GenerationResult> {
        let voice = self.fetch_remote(request, analysis).await?;
        Ok(self.deliver_remote(request, voice))
    }

    async fn fetch_remote(
        &self,
        request: &GenerationRequest,
        analysis: Option<&str>,
    ) -> Result<RemoteVoice> {
        let text = analysis.unwrap_or(&request.prompt);
        Ok(self
            .remote
            .generate_voice(text, request.wants_audio())
            .await?)
    }

    fn deliver_remote(&self, request: &GenerationRequest, voice: RemoteVoice) -> GenerationResult {
        let audio = match voice.audio {
            Some(audio) if request.wants_audio() => self.stream_remote_audio(audio),
            _ => None,
        };
        GenerationResult {
            text: voice.text,
            audio,
            served_by: ServiceMode::Cloud,
        }
    }

    async fn run_local(
        &self,
        request: &GenerationRequest,
        analysis: Option<&str>,
        stream: &Arc<LocalStream>,
    ) -> Result<GenerationResult> {
        let session = self
            .session
            .as_ref()
            .filter(|s| s.is_loaded())
            .cloned()
            .ok_or_else(|| VoiceError::ResourceUnavailable("local engine not loaded".into()))?;

        let text = analysis.unwrap_or(&request.prompt).to_string();
        let want_audio = request.wants_audio();
        let engine_stream = Arc::clone(stream);

        let text = tokio::task::spawn_blocking(move || {
            session.generate(
                &text,
                want_audio,
                |partial| debug!("Partial: {partial}"),
                move |chunk| engine_stream.emit(chunk),
            )
        })
        .await
        .map_err(|e| VoiceError::GenerationFailed(format!("generation task failed: {e}")))??;

        stream.finish(true);
        let chunks = stream.chunks();
        let audio = (want_audio && chunks > 0).then(|| AudioRef::Inline {
            chunks,
            samples: stream.tally.samples.load(Ordering::SeqCst),
            sample_rate: self.sink_sample_rate(),
        });

        Ok(GenerationResult {
            text,
            audio,
            served_by: ServiceMode::Local,
        })
    }

    fn sink_sample_rate(&self) -> u32 {
        self.sink
            .as_ref()
            .map(|s| s.sample_rate())
            .unwrap_or(crate::session::kokoro::SAMPLE_RATE)
    }

    /// Replay remote PCM through the sink; pass resources through untouched.
    fn stream_remote_audio(&self, audio: RemoteAudio) -> Option<AudioRef> {
        match audio {
            RemoteAudio::Resource { uri, mime } => Some(AudioRef::Remote { uri, mime }),
            RemoteAudio::Pcm { samples, .. } if samples.is_empty() => None,
            RemoteAudio::Pcm {
                samples,
                sample_rate,
            } => {
                if sample_rate != self.sink_sample_rate() {
                    warn!(
                        "Remote audio is {sample_rate}Hz but playback runs at {}Hz",
                        self.sink_sample_rate()
                    );
                }
                let tally = AudioTally::default();
                for piece in samples.chunks(REMOTE_CHUNK_SAMPLES) {
                    deliver_chunk(
                        self.sink.as_deref(),
                        &self.audio_events,
                        &tally,
                        AudioChunk::new(piece.to_vec()),
                    );
                }
                deliver_chunk(
                    self.sink.as_deref(),
                    &self.audio_events,
                    &tally,
                    AudioChunk::end_of_stream(),
                );
                Some(AudioRef::Inline {
                    chunks: tally.chunks.load(Ordering::SeqCst),
                    samples: tally.samples.load(Ordering::SeqCst),
                    sample_rate,
                })
            }
        }
    }
}

/// Whether a remote answer will be replayed through the sink.
fn voice_streams(request: &GenerationRequest, voice: &RemoteVoice) -> bool {
    request.wants_audio()
        && matches!(&voice.audio, Some(RemoteAudio::Pcm { samples, .. }) if !samples.is_empty())
}

/// Hand a chunk to the sink and the audio event stream, in production order.
fn deliver_chunk(
    sink: Option<&StreamingAudioSink>,
    events: &broadcast::Sender<AudioChunk>,
    tally: &AudioTally,
    chunk: AudioChunk,
) {
    if !chunk.samples.is_empty() {
        tally.chunks.fetch_add(1, Ordering::SeqCst);
        tally.samples.fetch_add(chunk.samples.len(), Ordering::SeqCst);
    }
    if let Some(sink) = sink {
        if let Err(e) = sink.push(chunk.clone()) {
            debug!("Sink rejected chunk: {e}");
        }
    }
    // No subscribers is fine.
    let _ = events.send(chunk);
}
