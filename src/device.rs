//! Device capability probing: decides whether on-device inference is advisable.

use std::fmt;

use tracing::debug;

use crate::config::DeviceConfig;

/// Storage assumed free when the config does not say otherwise.
const DEFAULT_STORAGE_GB: f64 = 16.0;
const FULL_TIER_MEMORY_GB: f64 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelTier {
    Full,
    Compact,
    None,
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Compact => write!(f, "compact"),
            Self::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecommendation {
    pub model_tier: ModelTier,
    pub is_local_recommended: bool,
    pub reason: String,
}

pub trait DeviceCapabilityProbe: Send + Sync {
    fn recommended_mode(&self, memory_gb: f64, storage_gb: f64) -> DeviceRecommendation;

    /// Recommendation for the machine we are running on.
    fn recommend(&self) -> DeviceRecommendation;
}

/// Threshold probe backed by /proc/meminfo, with config overrides.
pub struct SystemProbe {
    config: DeviceConfig,
}

impl SystemProbe {
    pub fn new(config: DeviceConfig) -> Self {
        Self { config }
    }

    fn memory_gb(&self) -> f64 {
        self.config
            .memory_gb
            .or_else(|| {
                std::fs::read_to_string("/proc/meminfo")
                    .ok()
                    .and_then(|s| parse_mem_total_gb(&s))
            })
            .unwrap_or(0.0)
    }

    fn storage_gb(&self) -> f64 {
        self.config.storage_gb.unwrap_or(DEFAULT_STORAGE_GB)
    }
}

impl DeviceCapabilityProbe for SystemProbe {
    fn recommended_mode(&self, memory_gb: f64, storage_gb: f64) -> DeviceRecommendation {
        let model_tier = if memory_gb >= FULL_TIER_MEMORY_GB {
            ModelTier::Full
        } else if memory_gb >= self.config.min_memory_gb {
            ModelTier::Compact
        } else {
            ModelTier::None
        };

        let enough_storage = storage_gb >= self.config.min_storage_gb;
        let is_local_recommended = model_tier != ModelTier::None && enough_storage;

        let reason = if model_tier == ModelTier::None {
            format!(
                "{memory_gb:.1} GB memory is below the {:.1} GB minimum",
                self.config.min_memory_gb
            )
        } else if !enough_storage {
            format!(
                "{storage_gb:.1} GB free storage is below the {:.1} GB minimum",
                self.config.min_storage_gb
            )
        } else {
            format!("{memory_gb:.1} GB memory supports the {model_tier} model")
        };

        DeviceRecommendation {
            model_tier,
            is_local_recommended,
            reason,
        }
    }

    fn recommend(&self) -> DeviceRecommendation {
        let memory = self.memory_gb();
        let storage = self.storage_gb();
        debug!("Device probe: {memory:.1} GB memory, {storage:.1} GB storage");
        self.recommended_mode(memory, storage)
    }
}

/// Probe with a fixed answer.
#[cfg(test)]
pub(crate) struct FixedProbe {
    pub local: bool,
}

#[cfg(test)]
impl DeviceCapabilityProbe for FixedProbe {
    fn recommended_mode(&self, _memory_gb: f64, _storage_gb: f64) -> DeviceRecommendation {
        self.recommend()
    }

    fn recommend(&self) -> DeviceRecommendation {
        DeviceRecommendation {
            model_tier: if self.local { ModelTier::Full } else { ModelTier::None },
            is_local_recommended: self.local,
            reason: "fixed".into(),
        }
    }
}

/// Parse `MemTotal:  16318480 kB` into gigabytes.
fn parse_mem_total_gb(meminfo: &str) -> Option<f64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / (1024.0 * 1024.0))
}
