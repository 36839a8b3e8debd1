//! Error types for the engine binary.

/// Top-level error for the engine binary.
///
/// Each variant wraps a specific subsystem error, providing a single
/// error type that `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ensemble_core::config::ConfigError,
    },

    /// The ensemble topology was rejected or the evaluator failed to start.
    #[error("evaluator error: {source}")]
    Evaluator {
        /// The underlying evaluator error.
        #[from]
        source: ensemble_evaluator::EvaluatorError,
    },

    /// The global tracing subscriber could not be installed.
    #[error("logging error: {message}")]
    Logging {
        /// Description of the failure.
        message: String,
    },

    /// Waiting for the interrupt signal failed.
    #[error("signal error: {source}")]
    Signal {
        /// The underlying I/O error.
        source: std::io::Error,
    },
}
