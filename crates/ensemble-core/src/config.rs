//! Configuration loading and typed config structures for the evaluator.
//!
//! The canonical configuration lives in `ensemble-config.yaml`. This
//! module defines strongly-typed structs that mirror the YAML structure,
//! and provides a loader that reads, overrides from the environment, and
//! validates the file.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A value parsed but is out of range or inconsistent.
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field.
        field: &'static str,
        /// Explanation of what is wrong.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level configuration.
///
/// Mirrors the structure of `ensemble-config.yaml`. All fields have
/// defaults, so an empty file yields a usable (if empty) ensemble.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EnsembleConfig {
    /// Network service settings.
    #[serde(default)]
    pub evaluator: EvaluatorConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Static ensemble topology served by the binary.
    #[serde(default)]
    pub ensemble: EnsembleSpec,
}

impl EnsembleConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override YAML values for the service address:
    /// - `EE_HOST` overrides `evaluator.host`
    /// - `EE_PORT` overrides `evaluator.port`
    /// - `EE_ID` overrides `evaluator.id`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value fails validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML, or
    /// [`ConfigError::Invalid`] if a value fails validation.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Self = serde_yml::from_str(yaml)?;
        config.evaluator.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.evaluator.validate()?;
        for stage in &self.ensemble.stages {
            if stage.id.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "ensemble.stages.id",
                    reason: "stage id must not be empty".to_owned(),
                });
            }
            if stage.steps.iter().any(|step| step.id.is_empty()) {
                return Err(ConfigError::Invalid {
                    field: "ensemble.stages.steps.id",
                    reason: format!("step id in stage {} must not be empty", stage.id),
                });
            }
        }
        Ok(())
    }
}

/// Network service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EvaluatorConfig {
    /// Evaluator instance id, used in every outbound `source`.
    #[serde(default = "default_evaluator_id")]
    pub id: String,

    /// Address to bind the listener to.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port to listen on (0 picks an ephemeral port).
    #[serde(default)]
    pub port: u16,

    /// Grace period, in seconds, given to connected reporters on shutdown.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Largest accepted inbound message, in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Inbound frames a reporter may have queued but unprocessed.
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,

    /// Outbound messages buffered per observer before it is dropped.
    #[serde(default = "default_observer_queue")]
    pub observer_queue: usize,
}

impl EvaluatorConfig {
    /// The drain grace period as a [`Duration`].
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Override service settings with environment variables when set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `EE_PORT` is not a port number.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("EE_HOST") {
            self.host = val;
        }
        if let Ok(val) = std::env::var("EE_PORT") {
            self.port = val.parse().map_err(|e| ConfigError::Invalid {
                field: "evaluator.port",
                reason: format!("EE_PORT={val}: {e}"),
            })?;
        }
        if let Ok(val) = std::env::var("EE_ID") {
            self.id = val;
        }
        Ok(())
    }

    /// Reject zero timeouts and caps.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("evaluator.drain_timeout_secs", self.drain_timeout_secs == 0),
            ("evaluator.max_message_size", self.max_message_size == 0),
            ("evaluator.max_queue", self.max_queue == 0),
            ("evaluator.observer_queue", self.observer_queue == 0),
        ];
        if let Some(&(field, _)) = positive.iter().find(|(_, is_zero)| *is_zero) {
            return Err(ConfigError::Invalid {
                field,
                reason: "must be greater than zero".to_owned(),
            });
        }
        if self.host.is_empty() {
            return Err(ConfigError::Invalid {
                field: "evaluator.host",
                reason: "must not be empty".to_owned(),
            });
        }
        Ok(())
    }
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            id: default_evaluator_id(),
            host: default_host(),
            port: 0,
            drain_timeout_secs: default_drain_timeout_secs(),
            max_message_size: default_max_message_size(),
            max_queue: default_max_queue(),
            observer_queue: default_observer_queue(),
        }
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-field lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Line format.
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Pretty,
        }
    }
}

/// Static description of the ensemble to evaluate.
///
/// Every realization shares the same stages, steps, and jobs.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EnsembleSpec {
    /// Number of realizations.
    #[serde(default)]
    pub size: usize,

    /// Stage layout applied to every realization.
    #[serde(default)]
    pub stages: Vec<StageSpec>,

    /// Free-form run metadata copied into the snapshot root.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// One stage of every realization.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StageSpec {
    /// Stage id.
    pub id: String,

    /// Steps in this stage.
    #[serde(default)]
    pub steps: Vec<StepSpec>,
}

/// One step of a stage.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StepSpec {
    /// Step id.
    pub id: String,

    /// Job names, in execution order. Job ids are their positions.
    #[serde(default)]
    pub jobs: Vec<String>,
}

// ---------------------------------------------------------------------------
// Default value functions (serde default requires named functions)
// ---------------------------------------------------------------------------

fn default_evaluator_id() -> String {
    "0".to_owned()
}

fn default_host() -> String {
    "127.0.0.1".to_owned()
}

const fn default_drain_timeout_secs() -> u64 {
    10
}

const fn default_max_message_size() -> usize {
    1 << 26
}

const fn default_max_queue() -> usize {
    500
}

const fn default_observer_queue() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_owned()
}
