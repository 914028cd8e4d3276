//! Remote backend over HTTP: Ollama for text and image analysis, plus an
//! optional OpenAI-compatible speech endpoint for audio.
//!
//! Speech is requested as raw PCM (16-bit little-endian, 24kHz mono), which
//! maps straight onto normalized samples without any container decoding.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{RemoteBackend, RemoteVoice};
use crate::config::RemoteConfig;
use crate::error::{RemoteError, RemoteErrorKind};
use crate::types::{ImagePayload, RemoteAudio};

const VOICE_PROMPT: &str = r#"Reply to the following in 1-3 short sentences suitable for text-to-speech. Be concise and conversational. Output ONLY the reply, nothing else.

Input: {text}

Reply:"#;

const IMAGE_PROMPT: &str = r#"Describe this image for someone who cannot see it, in 2-3 sentences. Focus on what matters for the request below. Output ONLY the description.

Request: {prompt}

Description:"#;

const SPEECH_SAMPLE_RATE: u32 = 24000;

pub struct OllamaBackend {
    config: RemoteConfig,
    client: Client,
}

impl OllamaBackend {
    pub fn new(config: RemoteConfig) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| format!("Failed to create HTTP client: {e}"))?;

        Ok(Self { config, client })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.config.api_key.as_deref() {
            Some(key) if !key.is_empty() => request.bearer_auth(key),
            _ => request,
        }
    }

    /// POST to /api/generate and return the trimmed `response` field.
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        images: Option<Vec<String>>,
    ) -> Result<String, RemoteError> {
        let mut body = json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": 0.3,
                "num_predict": 300
            }
        });
        if let Some(images) = images {
            body["images"] = json!(images);
        }

        let url = format!("{}/api/generate", self.config.host.trim_end_matches('/'));
        debug!("Sending to Ollama model '{model}' ({} chars)", prompt.len());

        let resp = self
            .authorized(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| transport_error(&self.config.host, e))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &detail));
        }

        let data = resp
            .json::<serde_json::Value>()
            .await
            .map_err(|e| RemoteError::new(RemoteErrorKind::Malformed, format!("invalid JSON: {e}")))?;
        let text = data["response"].as_str().unwrap_or("").trim().to_string();
        if text.is_empty() {
            return Err(RemoteError::new(
                RemoteErrorKind::Malformed,
                "empty response from Ollama",
            ));
        }
        Ok(text)
    }

    /// Fetch raw PCM speech for `text` from the speech endpoint.
    async fn synthesize(&self, speech_url: &str, text: &str) -> Result<RemoteAudio, RemoteError> {
        let url = format!("{}/v1/audio/speech", speech_url.trim_end_matches('/'));
        let body = json!({
            "model": self.config.speech_model,
            "input": text,
            "response_format": "pcm",
        });

        let resp = self
            .authorized(self.client.post(&url).json(&body))
            .send()
            .await
            .map_err(|e| transport_error(speech_url, e))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &detail));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| transport_error(speech_url, e))?;
        if bytes.len() < 2 {
            return Err(RemoteError::new(
                RemoteErrorKind::Malformed,
                "speech endpoint returned no audio",
            ));
        }

        Ok(RemoteAudio::Pcm {
            samples: pcm16le_to_samples(&bytes),
            sample_rate: SPEECH_SAMPLE_RATE,
        })
    }
}

#[async_trait]
impl RemoteBackend for OllamaBackend {
    async fn analyze_image(&self, image: &ImagePayload, prompt: &str) -> Result<String, RemoteError> {
        let t0 = Instant::now();
        let encoded = base64::engine::general_purpose::STANDARD.encode(&image.bytes);
        let prompt = IMAGE_PROMPT.replace("{prompt}", prompt);
        let text = self
            .generate(&self.config.vision_model, &prompt, Some(vec![encoded]))
            .await?;
        info!(
            "Analyzed {} byte {} image in {:.0}ms",
            image.bytes.len(),
            image.mime,
            t0.elapsed().as_secs_f64() * 1000.0
        );
        Ok(text)
    }

    async fn generate_voice(&self, text: &str, want_audio: bool) -> Result<RemoteVoice, RemoteError> {
        let t0 = Instant::now();
        let prompt = VOICE_PROMPT.replace("{text}", text);
        let reply = self.generate(&self.config.model, &prompt, None).await?;

        let speech_url = self.config.speech_url.trim();
        let audio = if want_audio && !speech_url.is_empty() {
            Some(self.synthesize(speech_url, &reply).await?)
        } else {
            if want_audio {
                debug!("No speech endpoint configured, returning text only");
            }
            None
        };

        info!(
            "Remote voice generated: {} chars, audio={} ({:.0}ms)",
            reply.len(),
            audio.is_some(),
            t0.elapsed().as_secs_f64() * 1000.0
        );
        Ok(RemoteVoice { text: reply, audio })
    }

    fn is_configured(&self) -> bool {
        !self.config.host.trim().is_empty() && !self.config.model.trim().is_empty()
    }
}

fn status_error(status: StatusCode, detail: &str) -> RemoteError {
    let preview: String = detail.chars().take(200).collect();
    let kind = match status.as_u16() {
        401 | 403 => RemoteErrorKind::Unauthorized,
        429 => RemoteErrorKind::RateLimited,
        500..=599 => RemoteErrorKind::ServerError,
        _ => RemoteErrorKind::Malformed,
    };
    warn!("Remote returned status {status}");
    RemoteError::new(kind, format!("HTTP {status}: {}", preview.trim()))
}

fn transport_error(host: &str, e: reqwest::Error) -> RemoteError {
    if e.is_connect() {
        warn!("Cannot connect to {host}");
    } else if e.is_timeout() {
        warn!("Request to {host} timed out");
    } else if e.is_decode() {
        return RemoteError::new(RemoteErrorKind::Malformed, e.to_string());
    } else {
        warn!("Request to {host} failed: {e}");
    }
    RemoteError::new(RemoteErrorKind::Network, e.to_string())
}

/// 16-bit little-endian PCM → normalized f32. A trailing odd byte is ignored.
fn pcm16le_to_samples(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}
