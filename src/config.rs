//! Speculation YAML config: load once at startup, merge with defaults,
//! validate hard.
//!
//! Missing fields fall back to defaults; out-of-range values fail with
//! [`ConfigError::Validation`] naming the offending field. Changing the
//! file at runtime requires an explicit reload.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Result type for config operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Adaptive-threshold sub-config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    pub enabled: bool,
    /// Lower clamp of the suggested threshold, in `[0.40, 0.90]`.
    pub min_threshold: f32,
    /// Upper clamp; must be strictly greater than `min_threshold`.
    pub max_threshold: f32,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_threshold: 0.40,
            max_threshold: 0.90,
        }
    }
}

/// Speculation engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeculationConfig {
    pub enabled: bool,
    /// Static gate, in `[0.40, 0.90]`.
    pub confidence_threshold: f32,
    /// Concurrent sandbox executions, in `1..=10`.
    pub max_concurrent_speculations: usize,
    /// Per-speculation deadline in milliseconds, `> 0`.
    pub speculation_timeout: u64,
    pub adaptive: AdaptiveConfig,
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.70,
            max_concurrent_speculations: 3,
            speculation_timeout: 10_000,
            adaptive: AdaptiveConfig::default(),
        }
    }
}

/// Raw YAML shape: every field optional so partial files merge with
/// defaults.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    enabled: Option<bool>,
    confidence_threshold: Option<f32>,
    max_concurrent_speculations: Option<usize>,
    speculation_timeout: Option<u64>,
    adaptive: Option<RawAdaptive>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAdaptive {
    enabled: Option<bool>,
    min_threshold: Option<f32>,
    max_threshold: Option<f32>,
}

impl SpeculationConfig {
    /// Parse YAML text, merging missing fields with defaults and validating.
    pub fn from_yaml(text: &str) -> ConfigResult<Self> {
        let raw: RawConfig = serde_yaml::from_str(text).map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        let defaults = Self::default();
        let raw_adaptive = raw.adaptive.unwrap_or_default();
        let config = Self {
            enabled: raw.enabled.unwrap_or(defaults.enabled),
            confidence_threshold: raw
                .confidence_threshold
                .unwrap_or(defaults.confidence_threshold),
            max_concurrent_speculations: raw
                .max_concurrent_speculations
                .unwrap_or(defaults.max_concurrent_speculations),
            speculation_timeout: raw
                .speculation_timeout
                .unwrap_or(defaults.speculation_timeout),
            adaptive: AdaptiveConfig {
                enabled: raw_adaptive.enabled.unwrap_or(defaults.adaptive.enabled),
                min_threshold: raw_adaptive
                    .min_threshold
                    .unwrap_or(defaults.adaptive.min_threshold),
                max_threshold: raw_adaptive
                    .max_threshold
                    .unwrap_or(defaults.adaptive.max_threshold),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn from_path(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Range checks; every violation names its field.
    pub fn validate(&self) -> ConfigResult<()> {
        if !(0.40..=0.90).contains(&self.confidence_threshold) {
            return Err(ConfigError::Validation {
                field: "confidence_threshold",
                message: format!(
                    "must be within [0.40, 0.90], got {}",
                    self.confidence_threshold
                ),
            });
        }
        if !(1..=10).contains(&self.max_concurrent_speculations) {
            return Err(ConfigError::Validation {
                field: "max_concurrent_speculations",
                message: format!("must be within 1..=10, got {}", self.max_concurrent_speculations),
            });
        }
        if self.speculation_timeout == 0 {
            return Err(ConfigError::Validation {
                field: "speculation_timeout",
                message: "must be > 0 ms".into(),
            });
        }
        if !(0.40..=0.90).contains(&self.adaptive.min_threshold) {
            return Err(ConfigError::Validation {
                field: "adaptive.min_threshold",
                message: format!("must be within [0.40, 0.90], got {}", self.adaptive.min_threshold),
            });
        }
        if !(0.40..=0.90).contains(&self.adaptive.max_threshold) {
            return Err(ConfigError::Validation {
                field: "adaptive.max_threshold",
                message: format!("must be within [0.40, 0.90], got {}", self.adaptive.max_threshold),
            });
        }
        if self.adaptive.max_threshold <= self.adaptive.min_threshold {
            return Err(ConfigError::Validation {
                field: "adaptive.max_threshold",
                message: format!(
                    "must be > adaptive.min_threshold ({} <= {})",
                    self.adaptive.max_threshold, self.adaptive.min_threshold
                ),
            });
        }
        if self.adaptive.enabled
            && !(self.adaptive.min_threshold..=self.adaptive.max_threshold)
                .contains(&self.confidence_threshold)
        {
            return Err(ConfigError::Validation {
                field: "confidence_threshold",
                message: format!(
                    "must lie within [adaptive.min_threshold, adaptive.max_threshold] = [{}, {}] when adaptive is enabled",
                    self.adaptive.min_threshold, self.adaptive.max_threshold
                ),
            });
        }
        Ok(())
    }
}
