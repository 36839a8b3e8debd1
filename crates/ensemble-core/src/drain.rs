//! Reporter accounting for graceful shutdown.
//!
//! Every connected reporter holds a [`ReporterGuard`]. On shutdown the
//! evaluator waits, bounded by a grace period, until every guard has been
//! dropped so that the last events of finishing jobs are merged before
//! observers are told the evaluation terminated.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Result of waiting for reporters to disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every reporter disconnected in time.
    Drained,
    /// The grace period elapsed first.
    TimedOut {
        /// Reporters still connected when the wait gave up.
        remaining: usize,
    },
}

/// Counts connected reporters and lets shutdown wait for zero.
#[derive(Debug, Clone)]
pub struct DrainController {
    count: Arc<watch::Sender<usize>>,
}

impl DrainController {
    /// Create a controller with no reporters registered.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0_usize);
        Self {
            count: Arc::new(tx),
        }
    }

    /// Count a new reporter. The count drops again when the guard does.
    pub fn register(&self) -> ReporterGuard {
        self.count.send_modify(|count| *count = count.saturating_add(1));
        ReporterGuard {
            count: Arc::clone(&self.count),
        }
    }

    /// Reporters currently connected.
    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until no reporter is connected, or until `timeout` elapses.
    pub async fn wait_idle(&self, timeout: Duration) -> DrainOutcome {
        let mut rx = self.count.subscribe();
        let drained = tokio::time::timeout(timeout, async {
            // The sender lives in `self`, so this cannot observe a closed channel.
            let _ = rx.wait_for(|count| *count == 0).await;
        })
        .await;
        match drained {
            Ok(()) => DrainOutcome::Drained,
            Err(_elapsed) => DrainOutcome::TimedOut {
                remaining: self.count(),
            },
        }
    }
}

impl Default for DrainController {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps one reporter counted for as long as it lives.
#[derive(Debug)]
pub struct ReporterGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for ReporterGuard {
    fn drop(&mut self) {
        self.count.send_modify(|count| *count = count.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_count_reporters() {
        let drain = DrainController::new();
        assert_eq!(drain.count(), 0);
        let first = drain.register();
        let second = drain.register();
        assert_eq!(drain.count(), 2);
        drop(first);
        assert_eq!(drain.count(), 1);
        drop(second);
        assert_eq!(drain.count(), 0);
    }

    #[tokio::test]
    async fn idle_controller_drains_immediately() {
        let drain = DrainController::new();
        assert_eq!(
            drain.wait_idle(Duration::from_millis(1)).await,
            DrainOutcome::Drained
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_with_remaining_count() {
        let drain = DrainController::new();
        let _guard = drain.register();
        assert_eq!(
            drain.wait_idle(Duration::from_secs(10)).await,
            DrainOutcome::TimedOut { remaining: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_resolves_when_last_reporter_leaves() {
        let drain = DrainController::new();
        let guard = drain.register();
        let leaver = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            drop(guard);
        });
        assert_eq!(
            drain.wait_idle(Duration::from_secs(10)).await,
            DrainOutcome::Drained
        );
        assert!(leaver.await.is_ok());
        assert_eq!(drain.count(), 0);
    }
}
