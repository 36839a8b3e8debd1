//! Merge engine: applies sparse diffs to the state tree.
//!
//! Reporters run independently, so their updates reach the evaluator in
//! arrival order, not causal order. The merge rules below resolve
//! conflicting updates deterministically:
//!
//! - **Status.** A terminal status (`Success`, `Failure`) is never replaced
//!   by a non-terminal one. Terminal to terminal is last-write-wins; every
//!   other change is last-arrival-wins.
//! - **Timestamps.** An absent field never clears a value. An incoming
//!   `end_time` earlier than the effective `start_time` is dropped, and an
//!   incoming `start_time` later than the effective `end_time` is dropped.
//! - **Job data.** Merged key by key; incoming keys overwrite.
//!
//! [`apply_update`] validates every path before touching the tree and
//! returns the *applied diff*, containing only fields whose value actually
//! changed. Re-applying an update therefore yields an empty diff, and
//! replaying the applied diffs in order on a copy of the starting tree
//! reproduces the merged tree. Observers rely on that to keep a mirror.

use chrono::{DateTime, Utc};
use ensemble_types::{
    Job, PartialJob, PartialRealization, PartialSnapshot, PartialStage, PartialStep, Realization,
    Snapshot, Stage, Status, Step,
};

/// A diff refers to an entity that does not exist in the tree.
///
/// The tree is built once from the topology, so this always means the
/// reporter and the topology disagree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    /// No realization with this id.
    #[error("unknown realization {real}")]
    UnknownRealization {
        /// Realization id from the diff.
        real: String,
    },

    /// No stage with this id in the realization.
    #[error("unknown stage {stage} in realization {real}")]
    UnknownStage {
        /// Realization id.
        real: String,
        /// Stage id from the diff.
        stage: String,
    },

    /// No step with this id in the stage.
    #[error("unknown step {step} in real/{real}/stage/{stage}")]
    UnknownStep {
        /// Realization id.
        real: String,
        /// Stage id.
        stage: String,
        /// Step id from the diff.
        step: String,
    },

    /// No job with this id in the step.
    #[error("unknown job {job} in real/{real}/stage/{stage}/step/{step}")]
    UnknownJob {
        /// Realization id.
        real: String,
        /// Stage id.
        stage: String,
        /// Step id.
        step: String,
        /// Job id from the diff.
        job: String,
    },
}

type Timestamp = Option<DateTime<Utc>>;

/// Apply a diff to the tree and return the fields that changed.
///
/// # Errors
///
/// Returns a [`MergeError`] for the first path in the diff that does not
/// exist in the tree. In that case the tree is left untouched.
pub fn apply_update(
    tree: &mut Snapshot,
    update: &PartialSnapshot,
) -> Result<PartialSnapshot, MergeError> {
    validate_paths(tree, update)?;

    let mut applied = PartialSnapshot::default();
    if let Some(status) = update.status.filter(|status| *status != tree.status) {
        tree.status = status;
        applied.status = Some(status);
    }
    for (real_id, real_update) in &update.reals {
        if let Some(real) = tree.reals.get_mut(real_id) {
            let diff = apply_realization(real, real_update);
            if !diff.is_empty() {
                applied.reals.insert(real_id.clone(), diff);
            }
        }
    }
    Ok(applied)
}

// ---------------------------------------------------------------------------
// Field rules
// ---------------------------------------------------------------------------

/// The status change to record, if any.
fn accepted_status(current: Status, incoming: Option<Status>) -> Option<Status> {
    let incoming = incoming?;
    if incoming == current || (current.is_terminal() && !incoming.is_terminal()) {
        return None;
    }
    Some(incoming)
}

/// The timestamp changes to record, if any, as `(start, end)`.
fn accepted_times(
    current_start: Timestamp,
    current_end: Timestamp,
    incoming_start: Timestamp,
    incoming_end: Timestamp,
) -> (Timestamp, Timestamp) {
    let start = incoming_start
        .filter(|start| current_start != Some(*start) && current_end.is_none_or(|end| *start <= end));
    let effective_start = start.or(current_start);
    let end = incoming_end
        .filter(|end| current_end != Some(*end) && effective_start.is_none_or(|start| *end >= start));
    (start, end)
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

/// Status, start, and end changes applied to one node.
struct Lifecycle {
    status: Option<Status>,
    start_time: Timestamp,
    end_time: Timestamp,
}

fn apply_lifecycle(
    status: &mut Status,
    start_time: &mut Timestamp,
    end_time: &mut Timestamp,
    incoming: &Lifecycle,
) -> Lifecycle {
    let new_status = accepted_status(*status, incoming.status);
    let (new_start, new_end) =
        accepted_times(*start_time, *end_time, incoming.start_time, incoming.end_time);
    if let Some(value) = new_status {
        *status = value;
    }
    if new_start.is_some() {
        *start_time = new_start;
    }
    if new_end.is_some() {
        *end_time = new_end;
    }
    Lifecycle {
        status: new_status,
        start_time: new_start,
        end_time: new_end,
    }
}

fn apply_realization(real: &mut Realization, update: &PartialRealization) -> PartialRealization {
    let mut applied = PartialRealization::default();
    if let Some(active) = update.active.filter(|active| *active != real.active) {
        real.active = active;
        applied.active = Some(active);
    }
    if let Some(state) = update.queue_state.filter(|state| *state != real.queue_state) {
        real.queue_state = state;
        applied.queue_state = Some(state);
    }
    let (start, end) = accepted_times(real.start_time, real.end_time, update.start_time, update.end_time);
    if start.is_some() {
        real.start_time = start;
        applied.start_time = start;
    }
    if end.is_some() {
        real.end_time = end;
        applied.end_time = end;
    }

    for (stage_id, stage_update) in &update.stages {
        if let Some(stage) = real.stages.get_mut(stage_id) {
            let diff = apply_stage(stage, stage_update);
            if !diff.is_empty() {
                applied.stages.insert(stage_id.clone(), diff);
            }
        }
    }
    applied
}

fn apply_stage(stage: &mut Stage, update: &PartialStage) -> PartialStage {
    let changed = apply_lifecycle(
        &mut stage.status,
        &mut stage.start_time,
        &mut stage.end_time,
        &Lifecycle {
            status: update.status,
            start_time: update.start_time,
            end_time: update.end_time,
        },
    );
    let mut applied = PartialStage {
        status: changed.status,
        start_time: changed.start_time,
        end_time: changed.end_time,
        ..PartialStage::default()
    };
    for (step_id, step_update) in &update.steps {
        if let Some(step) = stage.steps.get_mut(step_id) {
            let diff = apply_step(step, step_update);
            if !diff.is_empty() {
                applied.steps.insert(step_id.clone(), diff);
            }
        }
    }
    applied
}

fn apply_step(step: &mut Step, update: &PartialStep) -> PartialStep {
    let changed = apply_lifecycle(
        &mut step.status,
        &mut step.start_time,
        &mut step.end_time,
        &Lifecycle {
            status: update.status,
            start_time: update.start_time,
            end_time: update.end_time,
        },
    );
    let mut applied = PartialStep {
        status: changed.status,
        start_time: changed.start_time,
        end_time: changed.end_time,
        ..PartialStep::default()
    };
    for (job_id, job_update) in &update.jobs {
        if let Some(job) = step.jobs.get_mut(job_id) {
            let diff = apply_job(job, job_update);
            if !diff.is_empty() {
                applied.jobs.insert(job_id.clone(), diff);
            }
        }
    }
    applied
}

fn apply_job(job: &mut Job, update: &PartialJob) -> PartialJob {
    let changed = apply_lifecycle(
        &mut job.status,
        &mut job.start_time,
        &mut job.end_time,
        &Lifecycle {
            status: update.status,
            start_time: update.start_time,
            end_time: update.end_time,
        },
    );
    let mut applied = PartialJob {
        status: changed.status,
        start_time: changed.start_time,
        end_time: changed.end_time,
        ..PartialJob::default()
    };
    if let Some(name) = update.name.as_ref().filter(|name| **name != job.name) {
        job.name.clone_from(name);
        applied.name = Some(name.clone());
    }
    for (key, value) in &update.data {
        if job.data.get(key) != Some(value) {
            job.data.insert(key.clone(), value.clone());
            applied.data.insert(key.clone(), value.clone());
        }
    }
    applied
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate_paths(tree: &Snapshot, update: &PartialSnapshot) -> Result<(), MergeError> {
    for (real_id, real_update) in &update.reals {
        let real = tree
            .reals
            .get(real_id)
            .ok_or_else(|| MergeError::UnknownRealization {
                real: real_id.to_string(),
            })?;
        for (stage_id, stage_update) in &real_update.stages {
            let stage = real
                .stages
                .get(stage_id)
                .ok_or_else(|| MergeError::UnknownStage {
                    real: real_id.to_string(),
                    stage: stage_id.to_string(),
                })?;
            for (step_id, step_update) in &stage_update.steps {
                let step = stage
                    .steps
                    .get(step_id)
                    .ok_or_else(|| MergeError::UnknownStep {
                        real: real_id.to_string(),
                        stage: stage_id.to_string(),
                        step: step_id.to_string(),
                    })?;
                if let Some(job_id) = step_update.jobs.keys().find(|id| !step.jobs.contains_key(*id)) {
                    return Err(MergeError::UnknownJob {
                        real: real_id.to_string(),
                        stage: stage_id.to_string(),
                        step: step_id.to_string(),
                        job: job_id.to_string(),
                    });
                }
            }
        }
    }
    Ok(())
}
