//! Worker configuration: processing, retry, and error-handling policy
//!
//! All configuration is read-only after startup. `ProcessingConfig` acts as
//! a template on the registration builder: each registration gets its own
//! clone, so mutating one registration's config never affects another's.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level worker configuration, loadable from a TOML file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Application name; doubles as the topic subscription name and the
    /// default error queue prefix
    pub app_name: String,
    /// Broker connection string/URL, handed to the transport implementation
    pub broker_url: Option<String>,
    /// How long shutdown waits for in-flight deliveries to drain
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub error_handling: ErrorHandlingConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
}

fn default_shutdown_deadline_secs() -> u64 {
    30
}

impl WorkerConfig {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
            broker_url: None,
            shutdown_deadline_secs: default_shutdown_deadline_secs(),
            retry: RetryConfig::default(),
            error_handling: ErrorHandlingConfig::default(),
            processing: ProcessingConfig::default(),
        }
    }

    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: WorkerConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_app_name(&self.app_name)?;
        self.processing.validate()?;
        Ok(())
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_secs)
    }

    /// Default error queue name for this application
    pub fn default_error_queue(&self) -> String {
        format!("{}-error", self.app_name)
    }
}

/// Validate app name format (must match [a-zA-Z0-9._-]+)
fn validate_app_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidAppName(name.to_string()))
    }
}

/// Per-registration processing options for a broker processor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessingConfig {
    /// Number of messages to prefetch; 0 disables prefetching
    #[serde(default)]
    pub prefetch_count: u32,
    /// Maximum concurrent deliveries processed for this entity (default 1)
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    /// Override the entity's default message lock duration
    #[serde(default)]
    pub lock_duration_secs: Option<u64>,
    /// How long the processor keeps renewing a message lock (default 5 min)
    #[serde(default = "default_max_auto_lock_renewal_secs")]
    pub max_auto_lock_renewal_secs: u64,
}

fn default_max_concurrent_calls() -> usize {
    1
}

fn default_max_auto_lock_renewal_secs() -> u64 {
    300
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 0,
            max_concurrent_calls: default_max_concurrent_calls(),
            lock_duration_secs: None,
            max_auto_lock_renewal_secs: default_max_auto_lock_renewal_secs(),
        }
    }
}

impl ProcessingConfig {
    pub fn lock_duration(&self) -> Option<Duration> {
        self.lock_duration_secs.map(Duration::from_secs)
    }

    pub fn max_auto_lock_renewal(&self) -> Duration {
        Duration::from_secs(self.max_auto_lock_renewal_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_calls == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_concurrent_calls must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Process-wide retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Attempts after which a message is exhausted (default 10)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base redelivery delay in seconds; 0 republishes immediately
    #[serde(default)]
    pub delay_secs: u64,
    #[serde(default)]
    pub strategy: RetryStrategy,
}

fn default_max_retries() -> u32 {
    10
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_secs: 0,
            strategy: RetryStrategy::default(),
        }
    }
}

impl RetryConfig {
    /// Redelivery delay before the given attempt (1-based).
    ///
    /// Returns `None` when no base delay is configured, which republishes
    /// immediately.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        if self.delay_secs == 0 || attempt == 0 {
            return None;
        }
        let secs = match self.strategy {
            RetryStrategy::Linear => self.delay_secs.saturating_mul(attempt as u64),
            RetryStrategy::Exponential => {
                let exponent = (attempt - 1).min(16);
                self.delay_secs.saturating_mul(1u64 << exponent)
            }
        };
        Some(Duration::from_secs(secs))
    }
}

/// Retry delay growth strategy
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    #[default]
    Exponential,
    Linear,
}

/// Error-routing policy for terminally-failed messages
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ErrorHandlingConfig {
    /// Destination queue for error records; `None` falls back to dead-letter
    pub error_queue_name: Option<String>,
    /// Route unhandled handler failures to the error queue instead of
    /// dead-lettering them
    #[serde(default)]
    pub send_unhandled_to_error_queue: bool,
}

impl ErrorHandlingConfig {
    /// Error queue for retry-exhausted messages; any configured name applies
    pub fn exhaustion_queue(&self) -> Option<&str> {
        self.error_queue_name.as_deref()
    }

    /// Error queue for unhandled failures; requires routing to be enabled
    pub fn unhandled_queue(&self) -> Option<&str> {
        if self.send_unhandled_to_error_queue {
            self.error_queue_name.as_deref()
        } else {
            None
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid app name format: {0}")]
    InvalidAppName(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
