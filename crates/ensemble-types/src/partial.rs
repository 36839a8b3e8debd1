//! Sparse diffs over the state tree.
//!
//! A [`PartialSnapshot`] mirrors the [`Snapshot`](crate::Snapshot)
//! hierarchy, but every field is optional and only the paths that change
//! are present. Absent fields mean "leave as is"; there is no way to
//! express clearing a value, which is what keeps end times from ever
//! being unset.
//!
//! Partial snapshots are what reporters' events become after
//! translation, what the merge engine applies, and what observers receive
//! in `snapshot-update` messages.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::enums::{EnsembleStatus, QueueState, Status};
use crate::ids::{JobId, RealId, StageId, StepId};

/// Sparse overlay over the whole state tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PartialSnapshot {
    /// Changed realizations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reals: BTreeMap<RealId, PartialRealization>,
    /// New aggregate status. Only the evaluator produces this field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EnsembleStatus>,
}

/// Sparse overlay over one realization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PartialRealization {
    /// New active flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    /// New start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// New end time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// New queue state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_state: Option<QueueState>,
    /// Changed stages.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stages: BTreeMap<StageId, PartialStage>,
}

/// Sparse overlay over one stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PartialStage {
    /// New status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    /// New start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// New end time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Changed steps.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub steps: BTreeMap<StepId, PartialStep>,
}

/// Sparse overlay over one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PartialStep {
    /// New status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    /// New start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// New end time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Changed jobs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub jobs: BTreeMap<JobId, PartialJob>,
}

/// Sparse overlay over one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct PartialJob {
    /// New status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    /// New display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New start time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// New end time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Data keys to insert or overwrite.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, serde_json::Value>,
}

impl PartialSnapshot {
    /// Whether the diff changes nothing.
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.reals.values().all(PartialRealization::is_empty)
    }

    /// Get or create the overlay for a realization.
    pub fn realization_mut(&mut self, real: impl Into<RealId>) -> &mut PartialRealization {
        self.reals.entry(real.into()).or_default()
    }

    /// Get or create the overlay for a stage, creating parents as needed.
    pub fn stage_mut(
        &mut self,
        real: impl Into<RealId>,
        stage: impl Into<StageId>,
    ) -> &mut PartialStage {
        self.realization_mut(real)
            .stages
            .entry(stage.into())
            .or_default()
    }

    /// Get or create the overlay for a step, creating parents as needed.
    pub fn step_mut(
        &mut self,
        real: impl Into<RealId>,
        stage: impl Into<StageId>,
        step: impl Into<StepId>,
    ) -> &mut PartialStep {
        self.stage_mut(real, stage)
            .steps
            .entry(step.into())
            .or_default()
    }

    /// Get or create the overlay for a job, creating parents as needed.
    pub fn job_mut(
        &mut self,
        real: impl Into<RealId>,
        stage: impl Into<StageId>,
        step: impl Into<StepId>,
        job: impl Into<JobId>,
    ) -> &mut PartialJob {
        self.step_mut(real, stage, step)
            .jobs
            .entry(job.into())
            .or_default()
    }

    /// Look up the overlay for a stage, if present.
    pub fn stage(&self, real: &str, stage: &str) -> Option<&PartialStage> {
        self.reals.get(real)?.stages.get(stage)
    }

    /// Look up the overlay for a step, if present.
    pub fn step(&self, real: &str, stage: &str, step: &str) -> Option<&PartialStep> {
        self.stage(real, stage)?.steps.get(step)
    }

    /// Look up the overlay for a job, if present.
    pub fn job(&self, real: &str, stage: &str, step: &str, job: &str) -> Option<&PartialJob> {
        self.step(real, stage, step)?.jobs.get(job)
    }
}

impl PartialRealization {
    /// Whether the overlay changes nothing.
    pub fn is_empty(&self) -> bool {
        self.active.is_none()
            && self.start_time.is_none()
            && self.end_time.is_none()
            && self.queue_state.is_none()
            && self.stages.values().all(PartialStage::is_empty)
    }
}

impl PartialStage {
    /// Whether the overlay changes nothing.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.start_time.is_none()
            && self.end_time.is_none()
            && self.steps.values().all(PartialStep::is_empty)
    }
}

impl PartialStep {
    /// Whether the overlay changes nothing.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.start_time.is_none()
            && self.end_time.is_none()
            && self.jobs.values().all(PartialJob::is_empty)
    }
}

impl PartialJob {
    /// Whether the overlay changes nothing.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.name.is_none()
            && self.start_time.is_none()
            && self.end_time.is_none()
            && self.data.is_empty()
    }
}
