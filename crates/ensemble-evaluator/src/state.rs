//! Shared state for the evaluator's Axum application.
//!
//! [`EvaluatorState`] is wrapped in [`Arc`] and injected via Axum's
//! `State` extractor. It carries no mutable data of its own: the tree
//! lives in the control loop, reached through [`ControlHandle`], and the
//! rest is thread-safe signalling.

use std::sync::Arc;

use ensemble_core::config::EvaluatorConfig;
use ensemble_core::drain::DrainController;
use ensemble_types::{Snapshot, evaluator_source};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::control::{ControlHandle, ControlLoop};

/// Shared state for every connection handler.
#[derive(Debug, Clone)]
pub struct EvaluatorState {
    /// Sender side of the control loop.
    pub control: ControlHandle,
    /// Connected reporter counter.
    pub drain: DrainController,
    /// Fired to begin shutdown (`stop()` or an observer's
    /// `terminate-request`).
    pub done: CancellationToken,
    /// Fired once observers have been told the service terminated; all
    /// connections close and the listener stops accepting.
    pub close: CancellationToken,
    /// Tracks upgraded connection tasks so shutdown can wait for them.
    pub tracker: TaskTracker,
    /// Service settings.
    pub config: EvaluatorConfig,
}

impl EvaluatorState {
    /// Build the shared state and the control loop that owns `tree`.
    ///
    /// The loop must be spawned by the caller; until it runs, handlers
    /// block on their first command.
    pub fn new(
        tree: Snapshot,
        config: EvaluatorConfig,
        done: CancellationToken,
    ) -> (Arc<Self>, ControlLoop) {
        let (control_loop, control) = ControlLoop::new(
            tree,
            evaluator_source(&config.id),
            config.observer_queue,
        );
        let state = Self {
            control,
            drain: DrainController::new(),
            done,
            close: CancellationToken::new(),
            tracker: TaskTracker::new(),
            config,
        };
        (Arc::new(state), control_loop)
    }
}
