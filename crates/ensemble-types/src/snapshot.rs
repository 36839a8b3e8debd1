//! The canonical state tree of an ensemble evaluation.
//!
//! A [`Snapshot`] holds every realization of the ensemble, each with its
//! stages, steps, and jobs. The tree is built once from the static
//! ensemble topology and afterwards only mutated by the merge engine,
//! never restructured: no entity is added or removed during a run.
//!
//! Serialization is the nested-map form observers receive in the
//! `snapshot` message. Every field is always present (timestamps are
//! `null` until set) so a full snapshot round-trips without loss.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::{EnsembleStatus, QueueState, Status};
use crate::ids::{JobId, RealId, StageId, StepId};

/// Root of the state tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Snapshot {
    /// Realizations keyed by their ensemble index.
    pub reals: BTreeMap<RealId, Realization>,
    /// Aggregate status, set only by the evaluator.
    pub status: EnsembleStatus,
    /// Run metadata supplied by the topology provider.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// One member of the ensemble.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Realization {
    /// Whether the realization takes part in this run.
    pub active: bool,
    /// When the realization started running.
    pub start_time: Option<DateTime<Utc>>,
    /// When the realization finished.
    pub end_time: Option<DateTime<Utc>>,
    /// State reported by the job queue.
    pub queue_state: QueueState,
    /// Stages keyed by stage id.
    pub stages: BTreeMap<StageId, Stage>,
}

/// A group of steps within a realization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Stage {
    /// Current lifecycle status.
    pub status: Status,
    /// When the stage started running.
    pub start_time: Option<DateTime<Utc>>,
    /// When the stage reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
    /// Steps keyed by step id.
    pub steps: BTreeMap<StepId, Step>,
}

/// A group of jobs within a stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Step {
    /// Current lifecycle status.
    pub status: Status,
    /// When the step started.
    pub start_time: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
    /// Jobs keyed by job id.
    pub jobs: BTreeMap<JobId, Job>,
}

/// Leaf unit of work: one forward-model job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Job {
    /// Current lifecycle status.
    pub status: Status,
    /// Human-readable job name from the topology.
    pub name: String,
    /// When the job started.
    pub start_time: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    pub end_time: Option<DateTime<Utc>>,
    /// Free-form payload reported by the job (memory usage, error text...).
    pub data: BTreeMap<String, serde_json::Value>,
}

impl Snapshot {
    /// Look up a realization.
    pub fn realization(&self, real: &str) -> Option<&Realization> {
        self.reals.get(real)
    }

    /// Look up a stage by its full path.
    pub fn stage(&self, real: &str, stage: &str) -> Option<&Stage> {
        self.realization(real)?.stages.get(stage)
    }

    /// Look up a step by its full path.
    pub fn step(&self, real: &str, stage: &str, step: &str) -> Option<&Step> {
        self.stage(real, stage)?.steps.get(step)
    }

    /// Look up a job by its full path.
    pub fn job(&self, real: &str, stage: &str, step: &str, job: &str) -> Option<&Job> {
        self.step(real, stage, step)?.jobs.get(job)
    }

    /// Iterate over every job in the tree together with its path.
    pub fn jobs(&self) -> impl Iterator<Item = (&RealId, &StageId, &StepId, &JobId, &Job)> {
        self.reals.iter().flat_map(|(real_id, real)| {
            real.stages.iter().flat_map(move |(stage_id, stage)| {
                stage.steps.iter().flat_map(move |(step_id, step)| {
                    step.jobs
                        .iter()
                        .map(move |(job_id, job)| (real_id, stage_id, step_id, job_id, job))
                })
            })
        })
    }
}
