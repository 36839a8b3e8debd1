//! Service binary for the ensemble evaluator.
//!
//! Loads configuration, builds a static ensemble from it, and serves
//! observers and reporters until interrupted or until an observer asks
//! the evaluator to stop.
//!
//! # Startup Sequence
//!
//! 1. Load configuration from the path given as the first argument, or
//!    `ENSEMBLE_CONFIG`, or `ensemble-config.yaml`
//! 2. Initialize structured logging (tracing)
//! 3. Build the initial snapshot from the configured topology
//! 4. Bind the listener and start the evaluator thread
//! 5. Wait for Ctrl-C or a `terminate-request`
//! 6. Drain reporters and shut down

mod error;

use std::path::PathBuf;
use std::sync::Arc;

use ensemble_core::config::{EnsembleConfig, LogFormat, LoggingConfig};
use ensemble_core::topology::StaticEnsemble;
use ensemble_evaluator::Evaluator;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;

/// Default configuration file, relative to the working directory.
const DEFAULT_CONFIG: &str = "ensemble-config.yaml";

/// Application entry point.
///
/// # Errors
///
/// Returns an error if configuration, logging, or evaluator startup fails.
#[tokio::main]
async fn main() -> Result<(), EngineError> {
    // 1. Load configuration.
    let (config, config_path) = load_config()?;

    // 2. Initialize structured logging.
    init_logging(&config.logging)?;
    info!("ensemble-engine starting");
    match config_path {
        Some(path) => info!(path = %path.display(), "Configuration loaded"),
        None => info!("Config file not found, using defaults"),
    }

    // 3. Build the ensemble and its initial snapshot.
    let ensemble = Arc::new(StaticEnsemble::from_spec(&config.ensemble));
    let evaluator = Arc::new(Evaluator::new(ensemble, config.evaluator)?);

    // 4. Start serving.
    let addr = evaluator.run()?;
    info!(
        %addr,
        monitor_url = %evaluator.monitor_url().unwrap_or_default(),
        dispatch_url = %evaluator.dispatch_url().unwrap_or_default(),
        "Evaluator running"
    );

    // 5. Wait for a reason to stop.
    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|source| EngineError::Signal { source })?;
            info!("Interrupt received, stopping evaluator");
        }
        () = evaluator.stopped() => info!("Terminate requested by an observer"),
    }

    // 6. Drain and join the service thread off the async runtime.
    let stopping = Arc::clone(&evaluator);
    if let Err(e) = tokio::task::spawn_blocking(move || stopping.stop()).await {
        warn!(error = %e, "Evaluator stop task failed");
    }

    info!("ensemble-engine shutdown complete");
    Ok(())
}

/// Load configuration, falling back to defaults when no file exists.
///
/// Returns the path that was read, if any.
fn load_config() -> Result<(EnsembleConfig, Option<PathBuf>), EngineError> {
    let path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os("ENSEMBLE_CONFIG"))
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG), PathBuf::from);

    if path.exists() {
        let config = EnsembleConfig::from_file(&path)?;
        Ok((config, Some(path)))
    } else {
        let mut config = EnsembleConfig::default();
        config.evaluator.apply_env_overrides()?;
        config.validate()?;
        Ok((config, None))
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_logging(logging: &LoggingConfig) -> Result<(), EngineError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let result = match logging.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| EngineError::Logging {
        message: e.to_string(),
    })
}
