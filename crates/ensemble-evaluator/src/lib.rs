//! Real-time ensemble job-state aggregation and broadcast service.
//!
//! This crate provides an Axum `WebSocket` server that:
//!
//! - accepts forward-model progress events from any number of
//!   **reporters** on `/dispatch`, merging them into one canonical state
//!   tree;
//! - streams that tree to any number of **observers** on `/client`: a full
//!   snapshot on connect, then every applied diff, then `terminated`;
//! - shuts down cleanly on request, giving connected reporters a bounded
//!   grace period to deliver their last events.
//!
//! # Architecture
//!
//! [`Evaluator::run`] binds the listener and starts a dedicated thread
//! with a current-thread Tokio runtime. On it, a single
//! [`ControlLoop`](control::ControlLoop) task owns the tree, the event
//! index, and the observer registry; connection tasks talk to it through
//! a command channel, so there is no lock around the tree. The
//! [`Monitor`] client is the observer side, used by tests and tools.

pub mod control;
pub mod error;
pub mod evaluator;
pub mod monitor;
pub mod router;
pub mod server;
pub mod state;
pub mod ws;

// Re-export primary types for convenience.
pub use error::{ConnectionError, EvaluatorError, MonitorError, ServerError};
pub use evaluator::Evaluator;
pub use monitor::{Monitor, MonitorEvent};
pub use router::build_router;
pub use state::EvaluatorState;
