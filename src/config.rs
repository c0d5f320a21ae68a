//! Diff calculator configuration.
//!
//! Configuration is read from a JSON file, then individual fields can be
//! overridden through environment variables:
//!
//! - `DATABASE_URL`: work store connection string
//! - `DIFFCALC_HIGH_CONTENTION_MODE`: claim secondary work with random picks
//! - `DIFFCALC_DIFF_SERVICE_URL`: base URL of the diff service
//! - `DIFFCALC_PROM_PORT`: metrics listen address, e.g. `:20000`

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The configuration file is not valid JSON for this schema.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Longest accepted lease, and so the longest a single diff calculation may run.
pub const MAX_LEASE_DURATION_SECS: u64 = 24 * 60 * 60;

/// Longest accepted primary-branch staleness threshold.
pub const MAX_STALENESS_THRESHOLD_SECS: u64 = 30 * 24 * 60 * 60;

/// Longest accepted back-off after an empty queue.
pub const MAX_SLEEP_INTERVAL_SECS: u64 = 60 * 60;

/// Timing of the claim/compute loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Primary-branch groupings calculated more recently than this are skipped.
    pub staleness_threshold_secs: u64,
    /// How long a claimed row stays leased. Also the per-unit deadline.
    pub lease_duration_secs: u64,
    /// Back-off after a source reports no work.
    pub sleep_interval_secs: u64,
    /// Probability of picking review-branch work when both sources are ready.
    pub secondary_proportion: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_secs: 60,
            lease_duration_secs: 600,
            sleep_interval_secs: 10,
            secondary_proportion: 0.8,
        }
    }
}

impl SchedulerConfig {
    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_secs(self.staleness_threshold_secs)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn sleep_interval(&self) -> Duration {
        Duration::from_secs(self.sleep_interval_secs)
    }
}

/// Configuration for the diff calculator process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffCalculatorConfig {
    /// `postgresql://...` or `sqlite://<path>`.
    pub database_url: String,
    pub max_sql_connections: u32,
    /// Use the random-pick secondary claim instead of the transactional one.
    pub high_contention_mode: bool,
    pub diff_service_url: String,
    pub grouping_cache_size: usize,
    /// Metrics listen address; `:port` listens on all interfaces.
    pub prom_port: String,
    /// Read high-contention candidates this far in the past (CockroachDB only).
    pub stale_read_offset_ms: Option<u64>,
    /// Attempts per transaction before a serialization conflict is fatal.
    pub tx_max_attempts: u32,
    pub scheduler: SchedulerConfig,
}

impl Default for DiffCalculatorConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_sql_connections: 20,
            high_contention_mode: false,
            diff_service_url: "http://localhost:8000".to_string(),
            grouping_cache_size: 100_000,
            prom_port: ":20000".to_string(),
            stale_read_offset_ms: None,
            tx_max_attempts: 10,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl DiffCalculatorConfig {
    /// Parses a JSON configuration document. Missing fields take defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads the config file, applies environment overrides, and validates.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, an
    /// override is malformed, or the result fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_json(&contents)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides fields from environment variables that are set.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("DATABASE_URL") {
            self.database_url = val;
        }

        if let Ok(val) = std::env::var("DIFFCALC_HIGH_CONTENTION_MODE") {
            self.high_contention_mode = parse_env_bool(&val, "DIFFCALC_HIGH_CONTENTION_MODE")?;
        }

        if let Ok(val) = std::env::var("DIFFCALC_DIFF_SERVICE_URL") {
            self.diff_service_url = val;
        }

        if let Ok(val) = std::env::var("DIFFCALC_PROM_PORT") {
            self.prom_port = val;
        }

        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "database_url must be set".to_string(),
            ));
        }

        if self.max_sql_connections == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_sql_connections must be greater than 0".to_string(),
            ));
        }

        if self.diff_service_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "diff_service_url must be set".to_string(),
            ));
        }

        if self.tx_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "tx_max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.scheduler.lease_duration_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "lease_duration_secs must be greater than 0".to_string(),
            ));
        }

        if self.scheduler.lease_duration_secs > MAX_LEASE_DURATION_SECS {
            return Err(ConfigError::ValidationFailed(format!(
                "lease_duration_secs must be at most {}",
                MAX_LEASE_DURATION_SECS
            )));
        }

        if self.scheduler.staleness_threshold_secs > MAX_STALENESS_THRESHOLD_SECS {
            return Err(ConfigError::ValidationFailed(format!(
                "staleness_threshold_secs must be at most {}",
                MAX_STALENESS_THRESHOLD_SECS
            )));
        }

        if self.scheduler.sleep_interval_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "sleep_interval_secs must be greater than 0".to_string(),
            ));
        }

        if self.scheduler.sleep_interval_secs > MAX_SLEEP_INTERVAL_SECS {
            return Err(ConfigError::ValidationFailed(format!(
                "sleep_interval_secs must be at most {}",
                MAX_SLEEP_INTERVAL_SECS
            )));
        }

        if !(0.0..=1.0).contains(&self.scheduler.secondary_proportion) {
            return Err(ConfigError::ValidationFailed(
                "secondary_proportion must be between 0.0 and 1.0".to_string(),
            ));
        }

        Ok(())
    }

    /// Stale-read offset for high-contention candidate reads, if configured.
    pub fn stale_read_offset(&self) -> Option<Duration> {
        self.stale_read_offset_ms.map(Duration::from_millis)
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_high_contention_mode(mut self, enabled: bool) -> Self {
        self.high_contention_mode = enabled;
        self
    }
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
