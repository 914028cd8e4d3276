//! Inference session: the owning wrapper around one native engine handle.
//!
//! UNLOADED → LOADING → READY ⇄ GENERATING, and RELEASED from anywhere.
//! The handle never leaves this type; while a generation runs it is moved
//! out of the lock so `release()` can still proceed, and whoever holds the
//! handle when the release is observed frees it.

pub mod binding;
pub mod kokoro;

#[cfg(test)]
pub(crate) mod fake;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::error::{Result, VoiceError};
use crate::types::{AudioChunk, SessionState};

pub use binding::{AudioCallback, NativeEngineBinding, NativeHandle};

struct SessionInner {
    state: SessionState,
    handle: Option<Box<dyn NativeHandle>>,
}

pub struct InferenceSession {
    binding: Arc<dyn NativeEngineBinding>,
    config: SessionConfig,
    inner: Mutex<SessionInner>,
    /// One-shot guard: the first `release()` wins.
    released: AtomicBool,
    /// Set on release or `cancel()` so an in-flight `submit` can stop early.
    cancel_flag: AtomicBool,
}

impl InferenceSession {
    pub fn new(binding: Arc<dyn NativeEngineBinding>, config: SessionConfig) -> Self {
        Self {
            binding,
            config,
            inner: Mutex::new(SessionInner {
                state: SessionState::Unloaded,
                handle: None,
            }),
            released: AtomicBool::new(false),
            cancel_flag: AtomicBool::new(false),
        }
    }

    fn inner(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        self.inner().state
    }

    pub fn is_loaded(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Ready | SessionState::Generating
        )
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Load the engine. Blocking; run it off the async executor.
    pub fn load(&self, config_path: &Path) -> Result<()> {
        {
            let mut inner = self.inner();
            match inner.state {
                SessionState::Released => return Err(VoiceError::ResourceReleased),
                SessionState::Ready | SessionState::Generating => {
                    debug!("Session already loaded");
                    return Ok(());
                }
                SessionState::Loading => return Err(VoiceError::ConcurrencyRejected),
                SessionState::Unloaded => inner.state = SessionState::Loading,
            }
        }
        info!("Session: UNLOADED → LOADING ({})", config_path.display());

        if !config_path.exists() {
            self.abort_load();
            return Err(VoiceError::ResourceUnavailable(format!(
                "engine config not found: {}",
                config_path.display()
            )));
        }

        let t0 = Instant::now();
        let loaded = catch_unwind(AssertUnwindSafe(|| self.binding.load(config_path)))
            .unwrap_or_else(|panic| Err(panic_message(&*panic)));

        let mut handle = match loaded {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Engine load failed: {e}");
                self.abort_load();
                return Err(VoiceError::ResourceUnavailable(e));
            }
        };

        self.apply_config(handle.as_mut());

        let mut inner = self.inner();
        if inner.state == SessionState::Released {
            drop(inner);
            handle.release();
            info!("Session released during load, engine freed");
            return Err(VoiceError::ResourceReleased);
        }
        inner.handle = Some(handle);
        inner.state = SessionState::Ready;
        info!(
            "Session: LOADING → READY in {}ms",
            t0.elapsed().as_millis()
        );
        Ok(())
    }

    fn abort_load(&self) {
        let mut inner = self.inner();
        if inner.state == SessionState::Loading {
            inner.state = SessionState::Unloaded;
            info!("Session: LOADING → UNLOADED");
        }
    }

    fn apply_config(&self, handle: &mut dyn NativeHandle) {
        let settings = [
            ("threads", self.config.threads.to_string()),
            ("precision", self.config.precision.clone()),
            ("max_tokens", self.config.max_tokens.to_string()),
            ("audio", self.config.audio_enabled.to_string()),
            ("voice", self.config.voice.clone()),
            ("speed", self.config.speed.to_string()),
        ];
        for (key, value) in settings {
            if let Err(e) = handle.update_config(key, &value) {
                warn!("Engine rejected {key}={value}: {e}");
            }
        }
    }

    /// Run one generation, streaming partial text and (optionally) audio.
    ///
    /// Blocking. Exactly one end-of-stream chunk is emitted after the last
    /// audio chunk when audio was requested, including on failure.
    pub fn generate<F>(
        &self,
        prompt: &str,
        want_audio: bool,
        mut on_partial: impl FnMut(&str),
        on_audio: F,
    ) -> Result<String>
    where
        F: FnMut(AudioChunk) + Send + 'static,
    {
        let mut handle = {
            let mut inner = self.inner();
            match inner.state {
                SessionState::Released => return Err(VoiceError::ResourceReleased),
                SessionState::Generating => return Err(VoiceError::ConcurrencyRejected),
                SessionState::Unloaded | SessionState::Loading => {
                    return Err(VoiceError::ResourceUnavailable("model not loaded".into()))
                }
                SessionState::Ready => {}
            }
            let Some(handle) = inner.handle.take() else {
                return Err(VoiceError::ResourceUnavailable("engine handle missing".into()));
            };
            inner.state = SessionState::Generating;
            self.cancel_flag.store(false, Ordering::SeqCst);
            handle
        };
        debug!("Session: READY → GENERATING");

        let audio: Option<Arc<Mutex<F>>> = (want_audio && self.config.audio_enabled)
            .then(|| Arc::new(Mutex::new(on_audio)));

        match &audio {
            Some(sink) => {
                let sink = Arc::clone(sink);
                handle.set_audio_callback(Some(Box::new(move |samples: Vec<f32>| {
                    if samples.is_empty() {
                        return;
                    }
                    let mut emit = sink.lock().unwrap_or_else(PoisonError::into_inner);
                    (*emit)(AudioChunk::new(samples));
                })));
            }
            None => handle.set_audio_callback(None),
        }

        let t0 = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            handle.submit(prompt, &self.cancel_flag, &mut on_partial)
        }));
        handle.set_audio_callback(None);

        if let Some(sink) = audio {
            let mut emit = sink.lock().unwrap_or_else(PoisonError::into_inner);
            (*emit)(AudioChunk::end_of_stream());
        }

        {
            let mut inner = self.inner();
            if inner.state == SessionState::Released {
                drop(inner);
                handle.release();
                info!("Session released during generation, engine freed");
                return Err(VoiceError::ResourceReleased);
            }
            inner.handle = Some(handle);
            inner.state = SessionState::Ready;
        }
        debug!(
            "Session: GENERATING → READY in {}ms",
            t0.elapsed().as_millis()
        );

        match outcome {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => {
                warn!("Local generation failed: {e}");
                Err(VoiceError::GenerationFailed(e))
            }
            Err(panic) => {
                let message = panic_message(&*panic);
                error!("Local generation panicked: {message}");
                Err(VoiceError::GenerationFailed(message))
            }
        }
    }

    /// Ask an in-flight generation to stop. The engine stays loaded and the
    /// session returns to READY once `submit` unwinds. Returns false when
    /// nothing is generating.
    pub fn cancel(&self) -> bool {
        let inner = self.inner();
        if inner.state != SessionState::Generating {
            return false;
        }
        self.cancel_flag.store(true, Ordering::SeqCst);
        info!("Session: cancelling in-flight generation");
        true
    }

    /// Clear conversational history, keeping the engine loaded.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner();
        match inner.state {
            SessionState::Released => Err(VoiceError::ResourceReleased),
            SessionState::Generating => Err(VoiceError::ConcurrencyRejected),
            SessionState::Unloaded | SessionState::Loading => {
                Err(VoiceError::ResourceUnavailable("model not loaded".into()))
            }
            SessionState::Ready => {
                if let Some(handle) = inner.handle.as_mut() {
                    handle.reset();
                }
                debug!("Session history reset");
                Ok(())
            }
        }
    }

    /// Change the voice of a ready session.
    pub fn set_voice(&self, voice: &str) -> Result<()> {
        let mut inner = self.inner();
        match inner.state {
            SessionState::Released => Err(VoiceError::ResourceReleased),
            SessionState::Generating => Err(VoiceError::ConcurrencyRejected),
            SessionState::Unloaded | SessionState::Loading => {
                Err(VoiceError::ResourceUnavailable("model not loaded".into()))
            }
            SessionState::Ready => match inner.handle.as_mut() {
                Some(handle) => handle
                    .update_config("voice", voice)
                    .map_err(VoiceError::Configuration),
                None => Err(VoiceError::ResourceUnavailable("engine handle missing".into())),
            },
        }
    }

    /// Tear down the session. Safe to call any number of times, from any thread.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            debug!("Session already released");
            return;
        }

        let handle = {
            let mut inner = self.inner();
            let previous = inner.state;
            inner.state = SessionState::Released;
            self.cancel_flag.store(true, Ordering::SeqCst);
            info!("Session: {previous} → RELEASED");
            inner.handle.take()
        };

        if let Some(handle) = handle {
            handle.release();
            info!("Native engine handle freed");
        }
    }
}

impl Drop for InferenceSession {
    fn drop(&mut self) {
        self.release();
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "native engine panicked".to_string()
    }
}
