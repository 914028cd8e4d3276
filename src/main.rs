//! voice-relay-rs: prompt-to-speech with on-device Kokoro and a remote fallback.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use voice_relay::api::{self, ApiState};
use voice_relay::config::Config;
use voice_relay::sink;
use voice_relay::{AudioRef, Collaborators, GenerationRequest, ImagePayload, ServiceMode, VoiceContext};

/// Upper bound on waiting for the speaker to finish.
const PLAYBACK_WAIT: Duration = Duration::from_secs(300);

#[derive(Parser, Debug)]
#[command(name = "voice-relay-rs", about = "Prompt-to-speech with local inference and remote fallback")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Execution mode: local, cloud, or hybrid
    #[arg(short, long)]
    mode: Option<String>,

    /// Always use the remote backend
    #[arg(long)]
    force_remote: bool,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,

    /// Image to describe along with the prompt
    #[arg(long)]
    image: Option<PathBuf>,

    /// Return text only, no speech
    #[arg(long)]
    text_only: bool,

    /// Write the spoken audio to a WAV file
    #[arg(long)]
    save: Option<PathBuf>,

    /// Keep running and serve the HTTP API until Ctrl-C
    #[arg(long)]
    serve: bool,

    /// Prompt to answer
    prompt: Option<String>,
}

fn image_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Suppress noisy ort internals
    let filter = if args.verbose {
        EnvFilter::new("debug,ort=info")
    } else {
        EnvFilter::new("info,ort=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("voice-relay-rs starting");

    let mut config = Config::load(args.config.as_deref());
    if let Some(mode) = args.mode.as_deref() {
        match ServiceMode::from_str(mode) {
            Some(mode) => config.orchestrator.mode = mode,
            None => warn!("Unknown mode '{mode}', keeping {}", config.orchestrator.mode),
        }
    }
    if args.force_remote {
        config.orchestrator.force_remote = true;
    }
    info!(
        "Preferred mode: {} (force_remote={})",
        config.orchestrator.mode, config.orchestrator.force_remote
    );

    let collaborators = Collaborators::system(&config)?;
    let ctx = VoiceContext::init(config.clone(), collaborators).await?;

    let serve = args.serve || config.api.enabled;
    if serve {
        let state = ApiState {
            orchestrator: Arc::clone(ctx.orchestrator()),
        };
        api::start_api(state, config.api.port).await;
    }

    let mut outcome = Ok(());
    if let Some(prompt) = args.prompt {
        let mut request = if args.text_only {
            GenerationRequest::text(prompt)
        } else {
            GenerationRequest::speech(prompt)
        };
        if let Some(path) = &args.image {
            let bytes = std::fs::read(path)?;
            request = request.with_image(ImagePayload {
                bytes,
                mime: image_mime(path).to_string(),
            });
        }

        let finished = Arc::new(Notify::new());
        {
            let finished = Arc::clone(&finished);
            ctx.sink().set_on_complete(move || finished.notify_one());
        }

        // Collect streamed audio for export.
        let collector = args.save.as_ref().map(|_| {
            let mut events = ctx.orchestrator().subscribe_audio();
            tokio::spawn(async move {
                let mut samples = Vec::new();
                loop {
                    match events.recv().await {
                        Ok(chunk) => {
                            let end = chunk.is_end_of_stream();
                            samples.extend_from_slice(&chunk.samples);
                            if end {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(n)) => warn!("Export missed {n} audio chunks"),
                        Err(RecvError::Closed) => break,
                    }
                }
                samples
            })
        });

        match ctx.produce_voice(request).await {
            Ok(result) => {
                println!("{}", result.text);
                match &result.audio {
                    Some(AudioRef::Inline { sample_rate, .. }) => {
                        if ctx.sink().is_running()
                            && tokio::time::timeout(PLAYBACK_WAIT, finished.notified())
                                .await
                                .is_err()
                        {
                            warn!("Playback did not finish in time");
                        }
                        if let (Some(path), Some(collector)) = (&args.save, collector) {
                            let samples = collector.await?;
                            if let Err(e) = sink::write_wav(path, &samples, *sample_rate) {
                                warn!("Failed to save WAV: {e}");
                            }
                        }
                    }
                    Some(AudioRef::Remote { uri, mime }) => {
                        info!("Remote audio available at {uri} ({mime})");
                        if let Some(collector) = collector {
                            collector.abort();
                        }
                    }
                    None => {
                        if let Some(collector) = collector {
                            collector.abort();
                        }
                    }
                }
            }
            Err(e) => {
                error!("Generation failed: {e}");
                if let Some(collector) = collector {
                    collector.abort();
                }
                outcome = Err(e);
            }
        }
    }

    if serve {
        info!("Serving on 127.0.0.1:{} (Ctrl-C to stop)", config.api.port);
        tokio::signal::ctrl_c().await?;
    }

    ctx.shutdown();
    outcome?;
    Ok(())
}
