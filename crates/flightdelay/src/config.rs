//! Configuration management for flightdelay.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "flightdelay";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "flightdelay.db";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (`FLIGHTDELAY_<SECTION>__<KEY>`)
/// 2. TOML config file at `~/.config/flightdelay/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Prediction engine configuration.
    pub engine: EngineConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Live status poller configuration.
    pub poller: PollerConfig,
}

/// Prediction engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Span in seconds within which a live observation counts as fully
    /// confident. Past it, reported confidence halves every further window.
    pub freshness_window_secs: u64,
    /// Budget in milliseconds for a single prediction computation.
    pub compute_timeout_ms: u64,
    /// Maximum number of cached predictions before eviction kicks in.
    pub max_cached_predictions: usize,
    /// Minimum combined confidence for the "high" band.
    pub high_confidence_threshold: f64,
    /// Minimum combined confidence for the "medium" band.
    pub medium_confidence_threshold: f64,
}

/// Storage-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/flightdelay/flightdelay.db`
    pub database_path: Option<PathBuf>,
    /// Maximum age of stored observations and outcomes in days.
    /// Set to 0 for unlimited.
    pub max_age_days: u32,
    /// Write computed predictions back to storage for warm restarts.
    pub persist_predictions: bool,
}

/// Live status poller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Seconds between polls of a status source.
    pub interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            freshness_window_secs: 15 * 60,
            compute_timeout_ms: 2_000,
            max_cached_predictions: 10_000,
            high_confidence_threshold: 0.75,
            medium_confidence_threshold: 0.40,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None, // Will be resolved to default at runtime
            max_age_days: 30,
            persist_predictions: true,
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self { interval_secs: 60 }
    }
}

impl EngineConfig {
    /// Get the freshness window as a Duration.
    #[must_use]
    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }

    /// Get the compute budget as a Duration.
    #[must_use]
    pub fn compute_timeout(&self) -> Duration {
        Duration::from_millis(self.compute_timeout_ms)
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Configuration is loaded in this order (later sources override earlier):
    /// 1. Default values
    /// 2. TOML config file (if exists)
    /// 3. Environment variables (prefixed with `FLIGHTDELAY_`)
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file).nested())
            .merge(Env::prefixed("FLIGHTDELAY_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;

        if engine.freshness_window_secs == 0 {
            return Err(invalid("freshness_window_secs must be greater than 0"));
        }

        if engine.compute_timeout_ms == 0 {
            return Err(invalid("compute_timeout_ms must be greater than 0"));
        }

        if engine.max_cached_predictions == 0 {
            return Err(invalid("max_cached_predictions must be greater than 0"));
        }

        for (name, value) in [
            ("high_confidence_threshold", engine.high_confidence_threshold),
            (
                "medium_confidence_threshold",
                engine.medium_confidence_threshold,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(format!(
                    "{name} ({value}) must be between 0 and 1"
                )));
            }
        }

        if engine.medium_confidence_threshold > engine.high_confidence_threshold {
            return Err(invalid(format!(
                "medium_confidence_threshold ({}) cannot be greater than high_confidence_threshold ({})",
                engine.medium_confidence_threshold, engine.high_confidence_threshold
            )));
        }

        if self.poller.interval_secs == 0 {
            return Err(invalid("poller interval_secs must be greater than 0"));
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the max age as a Duration.
    #[must_use]
    pub fn max_age(&self) -> Option<Duration> {
        if self.storage.max_age_days == 0 {
            None
        } else {
            Some(Duration::from_secs(
                u64::from(self.storage.max_age_days) * 24 * 60 * 60,
            ))
        }
    }

    /// Get the poll interval as a Duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poller.interval_secs)
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}
