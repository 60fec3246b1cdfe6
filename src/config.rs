//! Pipeline configuration, loaded from TOML.
//!
//! All settings are validated up front: bounds, enum membership,
//! divisibility, and date parsing are checked before the pipeline starts,
//! so a misconfigured pipeline never processes a single event.
//!
//! ```toml
//! series_field = "url"
//! value_field = "hits"
//! realtime = false
//!
//! [window]
//! window_width = 3600
//!
//! [detect]
//! algorithm = "RPCA"
//!
//! [detect.config]
//! major_frequency = 24
//! minor_frequency = 168
//!
//! [gather]
//! span_width = 7200
//! statistic = "Sum"
//! last_date = "2016-06-01T00:00:00Z"
//!
//! [bin]
//! bin_width = 86400
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::stats::Statistic;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("'window_width' must be greater than zero")]
    WindowWidth,
    #[error("'max_procs' must be greater than zero")]
    MaxProcs,
    #[error("'major_frequency' must be greater than zero")]
    MajorFrequency,
    #[error("'minor_frequency' must be greater than zero")]
    MinorFrequency,
    #[error("'minor_frequency' must be divisible by 'major_frequency'")]
    FrequencyDivisibility,
    #[error("'span_width' must be greater than zero")]
    SpanWidth,
    #[error("unknown gather value field '{0}'")]
    UnknownValueField(String),
    #[error("could not parse 'last_date' '{value}': {source}")]
    LastDate {
        value: String,
        source: chrono::ParseError,
    },
    #[error("'bin_width' must be greater than zero")]
    BinWidth,
}

// ============================================================================
// Config Structs
// ============================================================================

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Inbound field holding the series key; empty means one global series.
    #[serde(default)]
    pub series_field: String,
    /// Inbound field holding the numeric value; empty means each event
    /// counts as 1.0.
    #[serde(default)]
    pub value_field: String,
    /// Realtime mode: expiration is driven by a wall-clock timer instead of
    /// incoming ruling timestamps.
    #[serde(default)]
    pub realtime: bool,
    pub window: WindowConfig,
    pub detect: DetectConfig,
    #[serde(default)]
    pub gather: GatherConfig,
    /// Binner runs only when this section is present.
    #[serde(default)]
    pub bin: Option<BinConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Bucket width in seconds.
    pub window_width: i64,
}

/// Detection algorithms the detector stage can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    #[serde(rename = "RPCA")]
    Rpca,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: Algorithm,
    /// Number of detector shards; defaults to the host CPU count.
    #[serde(default = "default_max_procs")]
    pub max_procs: usize,
    #[serde(rename = "config")]
    pub kernel: KernelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Season length, in windows.
    pub major_frequency: i64,
    /// Sliding history length, in windows; must be a multiple of
    /// `major_frequency`.
    pub minor_frequency: i64,
    #[serde(default = "default_true")]
    pub autodiff: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatherConfig {
    /// Skip the gather stage entirely; the pipeline stops at rulings.
    #[serde(default)]
    pub disabled: bool,
    /// Seconds of non-anomalous silence that end a span.
    #[serde(default)]
    pub span_width: i64,
    #[serde(default = "default_statistic")]
    pub statistic: Statistic,
    /// Ruling field aggregated into the span value list.
    #[serde(default = "default_gather_value_field")]
    pub value_field: String,
    /// Horizon past which no more data can arrive: "today", "yesterday", or
    /// an RFC-3339 date. Ignored in realtime mode.
    #[serde(default = "default_last_date")]
    pub last_date: String,
}

impl Default for GatherConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            span_width: 0,
            statistic: default_statistic(),
            value_field: default_gather_value_field(),
            last_date: default_last_date(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinConfig {
    /// Histogram bucket width in seconds.
    pub bin_width: i64,
}

fn default_algorithm() -> Algorithm {
    Algorithm::Rpca
}

fn default_max_procs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_true() -> bool {
    true
}

fn default_statistic() -> Statistic {
    Statistic::Sum
}

fn default_gather_value_field() -> String {
    "normed".to_string()
}

fn default_last_date() -> String {
    "today".to_string()
}

// ============================================================================
// Loading & Validation
// ============================================================================

impl PipelineConfig {
    /// Read, parse, and validate a TOML config file.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    /// Parse and validate a TOML config string.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every bound the stages depend on. Stage constructors re-check
    /// their own keys, so a config built in code goes through the same
    /// gates.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window.window_width <= 0 {
            return Err(ConfigError::WindowWidth);
        }
        if self.detect.max_procs == 0 {
            return Err(ConfigError::MaxProcs);
        }
        self.detect.kernel.validate()?;
        if !self.gather.disabled {
            self.gather.validate(self.realtime)?;
        }
        if let Some(bin) = &self.bin {
            if bin.bin_width <= 0 {
                return Err(ConfigError::BinWidth);
            }
        }
        Ok(())
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.major_frequency <= 0 {
            return Err(ConfigError::MajorFrequency);
        }
        if self.minor_frequency <= 0 {
            return Err(ConfigError::MinorFrequency);
        }
        if self.minor_frequency % self.major_frequency != 0 {
            return Err(ConfigError::FrequencyDivisibility);
        }
        Ok(())
    }
}

impl GatherConfig {
    pub fn validate(&self, realtime: bool) -> Result<(), ConfigError> {
        if self.span_width <= 0 {
            return Err(ConfigError::SpanWidth);
        }
        if !realtime {
            self.resolve_last_date()?;
        }
        Ok(())
    }

    /// Resolve the configured horizon to a concrete instant.
    pub fn resolve_last_date(&self) -> Result<DateTime<Utc>, ConfigError> {
        match self.last_date.as_str() {
            "today" => Ok(Utc::now()),
            "yesterday" => Ok(Utc::now() - Duration::hours(24)),
            other => DateTime::parse_from_rfc3339(other)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|source| ConfigError::LastDate {
                    value: other.to_string(),
                    source,
                }),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
