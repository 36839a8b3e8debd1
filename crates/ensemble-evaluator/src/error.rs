//! Error types for the evaluator service and the monitor client.
//!
//! [`ConnectionError`] covers failures that reject a single connection
//! and converts into an Axum HTTP response via its
//! [`IntoResponse`](axum::response::IntoResponse) implementation. Only
//! [`EvaluatorError`] ever reaches the caller of
//! [`Evaluator::run`](crate::Evaluator::run); everything that happens
//! after the listener is up is handled and logged inside the service.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ensemble_core::merge::MergeError;
use ensemble_core::topology::TopologyError;

/// Errors that reject a single incoming connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The first path segment is neither `client` nor `dispatch`.
    #[error("unknown connection role {role:?}")]
    UnknownRole {
        /// The path segment as requested.
        role: String,
    },
}

impl IntoResponse for ConnectionError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::UnknownRole { .. } => StatusCode::BAD_REQUEST,
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Errors from the HTTP server task.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listener could not be handed to the async runtime.
    #[error("failed to register listener: {source}")]
    Listener {
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// The server encountered a fatal error while serving.
    #[error("serve error: {source}")]
    Serve {
        /// The underlying I/O error.
        source: std::io::Error,
    },
}

/// Errors returned by [`Evaluator`](crate::Evaluator) lifecycle calls.
#[derive(Debug, thiserror::Error)]
pub enum EvaluatorError {
    /// The ensemble topology is inconsistent, or the collaborator failed
    /// to start the run.
    #[error("ensemble error: {source}")]
    Ensemble {
        /// The underlying topology error.
        #[from]
        source: TopologyError,
    },

    /// Failed to bind the listener to the configured address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The requested `host:port`.
        addr: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to build the runtime or spawn the service thread.
    #[error("failed to start evaluator thread: {source}")]
    Runtime {
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// `run` was called more than once.
    #[error("evaluator is already running")]
    AlreadyRunning,
}

/// Errors raised by the [`Monitor`](crate::Monitor) client.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// The evaluator has no listener to connect to yet.
    #[error("evaluator is not running")]
    NotRunning,

    /// The `WebSocket` handshake with the evaluator failed.
    #[error("failed to connect to {url}: {source}")]
    Connect {
        /// The evaluator URL.
        url: String,
        /// The underlying transport error.
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },

    /// Reading from or writing to the connection failed.
    #[error("connection error: {source}")]
    Transport {
        /// The underlying transport error.
        source: Box<tokio_tungstenite::tungstenite::Error>,
    },

    /// A message could not be encoded or decoded.
    #[error("malformed message: {source}")]
    Json {
        /// The underlying JSON error.
        #[from]
        source: serde_json::Error,
    },

    /// An update does not fit the mirrored tree.
    #[error("update does not match snapshot: {source}")]
    Merge {
        /// The underlying merge error.
        #[from]
        source: MergeError,
    },
}

impl From<tokio_tungstenite::tungstenite::Error> for MonitorError {
    fn from(source: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport {
            source: Box::new(source),
        }
    }
}
