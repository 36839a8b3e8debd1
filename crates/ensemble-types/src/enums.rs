//! Enumeration types for the ensemble state tree.
//!
//! Stages, steps, and jobs share the [`Status`] lifecycle. The root of
//! the tree carries an [`EnsembleStatus`] that only the evaluator sets,
//! and each realization tracks the [`QueueState`] reported by the job
//! queue that runs it.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ---------------------------------------------------------------------------
// Forward-model status
// ---------------------------------------------------------------------------

/// Lifecycle status of a stage, step, or job.
///
/// The normal progression is `Unknown -> Waiting -> Pending -> Running`
/// followed by one of the terminal states. Reporters are independent, so
/// updates can arrive out of order; the merge engine uses
/// [`Status::is_terminal`] to keep a finished entity from regressing.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS,
)]
#[ts(export, export_to = "bindings/")]
pub enum Status {
    /// Nothing has been reported yet.
    #[default]
    Unknown,
    /// Waiting for resources or upstream work.
    Waiting,
    /// Submitted and about to run.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully. Terminal.
    Success,
    /// Finished with an error. Terminal.
    Failure,
}

impl Status {
    /// Whether this status ends the entity's lifecycle.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

impl core::fmt::Display for Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::Waiting => "Waiting",
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Success => "Success",
            Self::Failure => "Failure",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Ensemble status
// ---------------------------------------------------------------------------

/// Aggregate status of the whole evaluation, stored at the tree root.
///
/// Never set by reporters. The evaluator moves it to `Running` once the
/// listener serves and to `Stopped` right before observers are told the
/// service terminated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub enum EnsembleStatus {
    /// The evaluator has not started serving.
    #[default]
    Unknown,
    /// The evaluator is accepting reporter events.
    Running,
    /// The evaluator has drained reporters and is shutting down.
    Stopped,
}

// ---------------------------------------------------------------------------
// Queue state
// ---------------------------------------------------------------------------

/// Job-queue state of a realization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueState {
    /// The realization is not part of this run.
    JobQueueNotActive,
    /// Waiting to be submitted.
    JobQueueWaiting,
    /// Submitted to the queue system.
    JobQueuePending,
    /// Running on the queue system.
    #[default]
    JobQueueRunning,
    /// The queue reported the realization done.
    JobQueueDone,
    /// The queue reported an abnormal exit.
    JobQueueExit,
    /// Completed and post-processed successfully.
    JobQueueSuccess,
    /// Completed and post-processing failed.
    JobQueueFailed,
    /// The queue state could not be determined.
    JobQueueUnknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_success_and_failure_are_terminal() {
        assert!(Status::Success.is_terminal());
        assert!(Status::Failure.is_terminal());
        for status in [Status::Unknown, Status::Waiting, Status::Pending, Status::Running] {
            assert!(!status.is_terminal(), "{status} should not be terminal");
        }
    }

    #[test]
    fn queue_state_uses_job_queue_vocabulary() {
        let json = serde_json::to_string(&QueueState::JobQueueRunning).unwrap_or_default();
        assert_eq!(json, "\"JOB_QUEUE_RUNNING\"");
    }

    #[test]
    fn status_serializes_as_variant_name() {
        let json = serde_json::to_string(&Status::Failure).unwrap_or_default();
        assert_eq!(json, "\"Failure\"");
        assert_eq!(Status::default(), Status::Unknown);
    }
}
