//! Scripted remote backend for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{RemoteBackend, RemoteVoice};
use crate::error::{RemoteError, RemoteErrorKind};
use crate::types::{ImagePayload, RemoteAudio};

#[derive(Default)]
pub struct FakeRemote {
    pub unconfigured: bool,
    pub fail: Option<RemoteErrorKind>,
    /// PCM returned at 24kHz when audio is requested.
    pub pcm: Option<Vec<f32>>,
    /// When set, `generate_voice` signals the first and waits on the second.
    pub hold: Option<(Arc<Notify>, Arc<Notify>)>,
    pub analyze_calls: AtomicUsize,
    pub voice_calls: AtomicUsize,
}

#[async_trait]
impl RemoteBackend for FakeRemote {
    async fn analyze_image(&self, image: &ImagePayload, prompt: &str) -> Result<String, RemoteError> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = self.fail {
            return Err(RemoteError::new(kind, "vision backend down"));
        }
        Ok(format!("{prompt}: a {} photo of a cat", image.mime))
    }

    async fn generate_voice(&self, text: &str, want_audio: bool) -> Result<RemoteVoice, RemoteError> {
        self.voice_calls.fetch_add(1, Ordering::SeqCst);
        if let Some((entered, proceed)) = &self.hold {
            entered.notify_one();
            proceed.notified().await;
        }
        if let Some(kind) = self.fail {
            return Err(RemoteError::new(kind, "backend down"));
        }
        let audio = match (&self.pcm, want_audio) {
            (Some(samples), true) => Some(RemoteAudio::Pcm {
                samples: samples.clone(),
                sample_rate: 24000,
            }),
            _ => None,
        };
        Ok(RemoteVoice {
            text: format!("remote: {text}"),
            audio,
        })
    }

    fn is_configured(&self) -> bool {
        !self.unconfigured
    }
}
