//! Configuration management for voice-relay-rs.
//!
//! Loads config from YAML files in standard locations. Every section
//! falls back to its defaults when omitted.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::types::ServiceMode;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Path to the engine config file. Its directory holds the model files.
    /// Empty means no local model is available.
    pub config_path: String,
    pub threads: usize,
    pub precision: String,
    pub max_tokens: usize,
    pub audio_enabled: bool,
    pub voice: String,
    pub speed: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            config_path: String::new(),
            threads: 4,
            precision: "fp32".into(),
            max_tokens: 510,
            audio_enabled: true,
            voice: "af_heart".into(),
            speed: 1.0,
        }
    }
}

impl SessionConfig {
    pub fn local_model_path(&self) -> Option<PathBuf> {
        let trimmed = self.config_path.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(PathBuf::from(trimmed))
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub mode: ServiceMode,
    pub force_remote: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub capacity: usize,
    pub sample_rate: u32,
    pub join_timeout_ms: u64,
    pub buffer_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            sample_rate: 24000,
            join_timeout_ms: 2000,
            buffer_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub model: String,
    pub vision_model: String,
    /// Base URL of an OpenAI-compatible speech endpoint. Empty disables remote audio.
    pub speech_url: String,
    pub speech_model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".into(),
            model: "llama3.2:3b".into(),
            vision_model: "llava:7b".into(),
            speech_url: String::new(),
            speech_model: "kokoro".into(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub memory_gb: Option<f64>,
    pub storage_gb: Option<f64>,
    pub min_memory_gb: f64,
    pub min_storage_gb: f64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            memory_gb: None,
            storage_gb: None,
            min_memory_gb: 4.0,
            min_storage_gb: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 8768,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub session: SessionConfig,
    pub orchestrator: OrchestratorConfig,
    pub sink: SinkConfig,
    pub remote: RemoteConfig,
    pub device: DeviceConfig,
    pub api: ApiConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/voice-relay/config.yaml
    /// 3. /etc/voice-relay/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/voice-relay/config.yaml")),
                Some(PathBuf::from("/etc/voice-relay/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    /// Parse YAML and replace values playback cannot run with by their defaults.
    pub fn parse(contents: &str) -> Result<Self, serde_yml::Error> {
        let mut config: Self = serde_yml::from_str(contents)?;
        config.sink.sanitize();
        Ok(config)
    }
}

impl SinkConfig {
    fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.sample_rate == 0 {
            warn!("sink.sample_rate must be positive, using {}", defaults.sample_rate);
            self.sample_rate = defaults.sample_rate;
        }
        if self.capacity == 0 {
            warn!("sink.capacity must be positive, using {}", defaults.capacity);
            self.capacity = defaults.capacity;
        }
    }
}
