//! Local HTTP API over the orchestrator.
//!
//! Binds to 127.0.0.1 only. `POST /generate` runs one request to completion;
//! a request arriving while another is in flight gets 409 immediately.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::VoiceError;
use crate::orchestrator::GenerationOrchestrator;
use crate::types::{AudioRef, GenerationRequest, ImagePayload, Modality};

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<GenerationOrchestrator>,
}

// --- Request/Response types ---

#[derive(Deserialize)]
struct GenerateBody {
    prompt: String,
    #[serde(default)]
    image_base64: Option<String>,
    #[serde(default = "default_mime")]
    mime: String,
    #[serde(default = "default_audio")]
    audio: bool,
}

fn default_mime() -> String {
    "image/jpeg".to_string()
}

fn default_audio() -> bool {
    true
}

#[derive(Serialize)]
struct StatusResponse {
    state: String,
    mode: Option<String>,
    session: Option<String>,
    busy: bool,
}

#[derive(Serialize)]
struct GenerateResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    served_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    audio: Option<AudioRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl GenerateResponse {
    fn err(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            text: None,
            served_by: None,
            audio: None,
            error: Some(message.into()),
        }
    }
}

/// HTTP status for a failed generation.
fn error_status(err: &VoiceError) -> StatusCode {
    match err {
        VoiceError::ConcurrencyRejected => StatusCode::CONFLICT,
        VoiceError::Configuration(_) => StatusCode::BAD_REQUEST,
        VoiceError::ResourceReleased => StatusCode::GONE,
        VoiceError::Remote(_) => StatusCode::BAD_GATEWAY,
        VoiceError::ResourceUnavailable(_) | VoiceError::GenerationFailed(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Build the axum router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/generate", post(handle_generate))
        .with_state(state)
}

/// Start the API server as a background tokio task.
pub async fn start_api(state: ApiState, port: u16) {
    let app = router(state);
    let addr = format!("127.0.0.1:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to bind API on {addr}: {e}");
            return;
        }
    };
    info!("API server listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("API server error: {e}");
        }
    });
}

// --- Handlers ---

async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let orchestrator = &state.orchestrator;
    Json(StatusResponse {
        state: orchestrator.state().to_string(),
        mode: orchestrator.effective_mode().map(|m| m.to_string()),
        session: orchestrator.session().map(|s| s.state().to_string()),
        busy: orchestrator.is_busy(),
    })
}

async fn handle_generate(
    State(state): State<ApiState>,
    Json(body): Json<GenerateBody>,
) -> (StatusCode, Json<GenerateResponse>) {
    if body.prompt.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(GenerateResponse::err("empty prompt")));
    }

    let mut request = GenerationRequest {
        prompt: body.prompt,
        image: None,
        modality: if body.audio {
            Modality::TextAndAudio
        } else {
            Modality::Text
        },
    };
    if let Some(encoded) = body.image_base64 {
        match base64::engine::general_purpose::STANDARD.decode(encoded.trim()) {
            Ok(bytes) => {
                request = request.with_image(ImagePayload {
                    bytes,
                    mime: body.mime,
                })
            }
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(GenerateResponse::err(format!("invalid image_base64: {e}"))),
                )
            }
        }
    }

    let preview: String = request.prompt.chars().take(80).collect();
    info!(
        "HTTP /generate: \"{}{}\" (image={}, audio={})",
        preview.replace('\n', " "),
        if request.prompt.len() > 80 { "..." } else { "" },
        request.image.is_some(),
        request.wants_audio(),
    );

    match state.orchestrator.produce_voice(request).await {
        Ok(result) => (
            StatusCode::OK,
            Json(GenerateResponse {
                status: "ok".into(),
                text: Some(result.text),
                served_by: Some(result.served_by.to_string()),
                audio: result.audio,
                error: None,
            }),
        ),
        Err(e) => (error_status(&e), Json(GenerateResponse::err(e.reason()))),
    }
}
