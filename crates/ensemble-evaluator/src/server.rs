//! Evaluator server lifecycle management.
//!
//! [`serve_until_done`] runs the Axum server and the control loop until
//! the done token fires, then shuts down in two phases:
//!
//! 1. **Drain.** Wait, up to the drain timeout, for every reporter to
//!    disconnect so in-flight events are merged.
//! 2. **Close.** Mark the ensemble stopped, send `terminated` to every
//!    observer, fire the close token so the listener stops accepting and
//!    remaining connections close, then wait (again bounded) for tracked
//!    connection tasks to finish.

use std::sync::Arc;

use ensemble_core::drain::DrainOutcome;
use ensemble_types::{EnsembleStatus, PartialSnapshot};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::control::ControlLoop;
use crate::error::ServerError;
use crate::router::build_router;
use crate::state::EvaluatorState;

/// Serve observers and reporters until the done token fires, then drain
/// and shut down.
///
/// # Errors
///
/// Returns [`ServerError::Serve`] if the server hits a fatal I/O error.
pub async fn serve_until_done(
    listener: TcpListener,
    state: Arc<EvaluatorState>,
    control_loop: ControlLoop,
) -> Result<(), ServerError> {
    let control_task = tokio::spawn(control_loop.run());

    // Queued before the first connection is accepted, so every observer's
    // snapshot already shows the ensemble running.
    state
        .control
        .apply(PartialSnapshot {
            status: Some(EnsembleStatus::Running),
            ..PartialSnapshot::default()
        })
        .await;

    let addr = listener.local_addr().ok();
    let router = build_router(Arc::clone(&state));
    let close = state.close.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { close.cancelled().await })
            .await
    });
    info!(?addr, evaluator = %state.config.id, "Evaluator listening");

    state.done.cancelled().await;
    let drain_timeout = state.config.drain_timeout();
    info!(
        reporters = state.drain.count(),
        timeout_secs = drain_timeout.as_secs(),
        "Done signal received, draining reporters"
    );
    match state.drain.wait_idle(drain_timeout).await {
        DrainOutcome::Drained => debug!("All reporters disconnected"),
        DrainOutcome::TimedOut { remaining } => {
            warn!(remaining, "Drain timed out with reporters still connected");
        }
    }

    state.control.terminate().await;
    state.close.cancel();
    state.tracker.close();
    if tokio::time::timeout(drain_timeout, state.tracker.wait())
        .await
        .is_err()
    {
        warn!(
            connections = state.tracker.len(),
            "Connections did not close in time"
        );
    }

    let result = match server.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(ServerError::Serve { source }),
        Err(e) => {
            warn!(error = %e, "Server task ended abnormally");
            Ok(())
        }
    };
    control_task.abort();
    info!("Evaluator server exited");
    result
}
