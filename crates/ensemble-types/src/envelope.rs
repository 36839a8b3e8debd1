//! Wire envelope and event type vocabulary.
//!
//! Every message on an evaluator connection is a JSON [`Envelope`] of the
//! form `{type, source, id, time?, data?}`; any other top-level keys are
//! kept in [`Envelope::extra`]. The only exception is the
//! reporter end-of-stream sentinel, the literal text [`END_OF_STREAM`].
//!
//! | Type | Direction |
//! |------|-----------|
//! | [`SNAPSHOT`] | service -> observer |
//! | [`SNAPSHOT_UPDATE`] | service -> observer |
//! | [`TERMINATED`] | service -> observer |
//! | [`TERMINATE_REQUEST`] | observer -> service |
//! | `forward-model-*` ([`EventType`]) | reporter -> service |

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::partial::PartialSnapshot;
use crate::snapshot::Snapshot;

/// Full state tree, sent once to each observer right after it connects.
pub const SNAPSHOT: &str = "snapshot";
/// Applied diff, broadcast to every observer after each merged event.
pub const SNAPSHOT_UPDATE: &str = "snapshot-update";
/// Final message before the service closes all connections.
pub const TERMINATED: &str = "terminated";
/// Observer asks the service to begin shutdown.
pub const TERMINATE_REQUEST: &str = "terminate-request";
/// Reporter sentinel that ends its stream without being translated.
pub const END_OF_STREAM: &str = "null";

/// Build the `source` attribute identifying an evaluator instance.
pub fn evaluator_source(evaluator_id: &str) -> String {
    format!("/ensemble/evaluator/{evaluator_id}")
}

/// A structured event as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Envelope {
    /// Message type, e.g. `snapshot-update` or `forward-model-job-running`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Who produced the message. Reporters may encode the job path here.
    #[serde(default)]
    pub source: String,
    /// Event index. Strictly increasing on outbound messages; reporters
    /// may leave it out.
    #[serde(default)]
    pub id: u64,
    /// When the event happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Type-specific payload.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    /// Top-level attributes beyond the ones above. Some reporters put the
    /// job path (`real`, `stage`, `step`, `job`) here instead of in
    /// `source` or `data`.
    #[serde(flatten)]
    #[ts(skip)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Envelope {
    /// Create an envelope without payload or timestamp.
    pub fn new(kind: impl Into<String>, source: impl Into<String>, id: u64) -> Self {
        Self {
            kind: kind.into(),
            source: source.into(),
            id,
            time: None,
            data: serde_json::Value::Null,
            extra: BTreeMap::new(),
        }
    }

    /// Attach a JSON payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Attach a timestamp.
    #[must_use]
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    /// Wrap a full state tree in a `snapshot` message.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree cannot be converted to JSON.
    pub fn snapshot(source: &str, id: u64, tree: &Snapshot) -> Result<Self, serde_json::Error> {
        Ok(Self::new(SNAPSHOT, source, id).with_data(serde_json::to_value(tree)?))
    }

    /// Wrap an applied diff in a `snapshot-update` message.
    ///
    /// # Errors
    ///
    /// Returns an error if the diff cannot be converted to JSON.
    pub fn snapshot_update(
        source: &str,
        id: u64,
        diff: &PartialSnapshot,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(SNAPSHOT_UPDATE, source, id).with_data(serde_json::to_value(diff)?))
    }

    /// The `terminated` message.
    pub fn terminated(source: &str, id: u64) -> Self {
        Self::new(TERMINATED, source, id)
    }

    /// The `terminate-request` message an observer sends.
    pub fn terminate_request(source: &str) -> Self {
        Self::new(TERMINATE_REQUEST, source, 0)
    }

    /// Parse the message type into the forward-model vocabulary.
    pub fn event_type(&self) -> EventType {
        EventType::parse(&self.kind)
    }
}

// ---------------------------------------------------------------------------
// Forward-model event types
// ---------------------------------------------------------------------------

/// Stage transitions reported by the queue driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageEvent {
    /// Stage is waiting for resources.
    Waiting,
    /// Stage was submitted.
    Pending,
    /// Stage started running.
    Running,
    /// Stage completed successfully.
    Success,
    /// Stage failed.
    Failure,
    /// Stage status could not be determined.
    Unknown,
}

/// Step transitions reported by the job runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepEvent {
    /// Step began.
    Start,
    /// Step completed successfully.
    Success,
    /// Step failed.
    Failure,
}

/// Job transitions reported by the job runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobEvent {
    /// Job process was launched.
    Start,
    /// Periodic liveness report, usually with resource usage in `data`.
    Running,
    /// Job exited successfully.
    Success,
    /// Job exited with an error.
    Failure,
}

/// The forward-model lifecycle group of event types.
///
/// Unknown type strings are kept in [`EventType::Unrecognized`] so the
/// caller can log them; they are never a dispatch failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    /// A stage transition.
    Stage(StageEvent),
    /// A step transition.
    Step(StepEvent),
    /// A job transition.
    Job(JobEvent),
    /// Any other type string.
    Unrecognized(String),
}

/// Canonical wire name, short alias, and parsed type for every
/// recognized forward-model event.
static FORWARD_MODEL_TYPES: [(&str, &str, EventType); 13] = [
    ("forward-model-stage-waiting", "stage_waiting", EventType::Stage(StageEvent::Waiting)),
    ("forward-model-stage-pending", "stage_pending", EventType::Stage(StageEvent::Pending)),
    ("forward-model-stage-running", "stage_running", EventType::Stage(StageEvent::Running)),
    ("forward-model-stage-success", "stage_success", EventType::Stage(StageEvent::Success)),
    ("forward-model-stage-failure", "stage_failure", EventType::Stage(StageEvent::Failure)),
    ("forward-model-stage-unknown", "stage_unknown", EventType::Stage(StageEvent::Unknown)),
    ("forward-model-step-start", "step_start", EventType::Step(StepEvent::Start)),
    ("forward-model-step-success", "step_success", EventType::Step(StepEvent::Success)),
    ("forward-model-step-failure", "step_failure", EventType::Step(StepEvent::Failure)),
    ("forward-model-job-start", "job_start", EventType::Job(JobEvent::Start)),
    ("forward-model-job-running", "job_running", EventType::Job(JobEvent::Running)),
    ("forward-model-job-success", "job_success", EventType::Job(JobEvent::Success)),
    ("forward-model-job-failure", "job_failure", EventType::Job(JobEvent::Failure)),
];

impl EventType {
    /// Parse a wire type string. Accepts both the canonical
    /// `forward-model-*` names and the short `job_running` style aliases.
    pub fn parse(kind: &str) -> Self {
        FORWARD_MODEL_TYPES
            .iter()
            .find(|(canonical, alias, _)| *canonical == kind || *alias == kind)
            .map_or_else(
                || Self::Unrecognized(kind.to_owned()),
                |(_, _, parsed)| parsed.clone(),
            )
    }

    /// Canonical wire name, or the original string if unrecognized.
    pub fn as_str(&self) -> &str {
        if let Self::Unrecognized(kind) = self {
            return kind;
        }
        FORWARD_MODEL_TYPES
            .iter()
            .find(|(_, _, parsed)| parsed == self)
            .map_or("", |(canonical, _, _)| *canonical)
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_names_and_aliases() {
        assert_eq!(
            EventType::parse("forward-model-job-running"),
            EventType::Job(JobEvent::Running)
        );
        assert_eq!(
            EventType::parse("job_success"),
            EventType::Job(JobEvent::Success)
        );
        assert_eq!(
            EventType::parse("stage_waiting"),
            EventType::Stage(StageEvent::Waiting)
        );
    }

    #[test]
    fn unknown_types_are_kept_verbatim() {
        let parsed = EventType::parse("forward-model-job-exploded");
        assert_eq!(
            parsed,
            EventType::Unrecognized(String::from("forward-model-job-exploded"))
        );
        assert_eq!(parsed.as_str(), "forward-model-job-exploded");
    }

    #[test]
    fn as_str_returns_canonical_name_for_aliases() {
        assert_eq!(
            EventType::parse("step_start").as_str(),
            "forward-model-step-start"
        );
    }

    #[test]
    fn envelope_uses_type_as_field_name() {
        let envelope = Envelope::terminated(&evaluator_source("7"), 42);
        let json = serde_json::to_value(&envelope).unwrap_or_default();
        assert_eq!(
            json,
            serde_json::json!({"type": "terminated", "source": "/ensemble/evaluator/7", "id": 42})
        );
    }

    #[test]
    fn reporter_envelope_without_id_parses() {
        let raw = r#"{"type":"job_running","source":"/reporter","data":{"real":0}}"#;
        let envelope: Option<Envelope> = serde_json::from_str(raw).ok();
        assert_eq!(envelope.as_ref().map(|e| e.id), Some(0));
        assert_eq!(
            envelope.map(|e| e.event_type()),
            Some(EventType::Job(JobEvent::Running))
        );
    }

    #[test]
    fn unknown_top_level_keys_are_kept() {
        let raw = r#"{"type":"job_running","real":0,"stage":"0","id":3}"#;
        let envelope: Option<Envelope> = serde_json::from_str(raw).ok();
        let extra = envelope.map(|e| e.extra).unwrap_or_default();
        assert_eq!(extra.get("real"), Some(&serde_json::json!(0)));
        assert_eq!(extra.get("stage"), Some(&serde_json::json!("0")));
        assert!(!extra.contains_key("id"));
    }
}
