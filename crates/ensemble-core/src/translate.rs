//! Translation of reporter events into state tree diffs.
//!
//! A reporter event names an entity (by path) and a lifecycle transition.
//! [`translate`] turns it into a [`PartialSnapshot`] touching exactly that
//! entity. It never reads the clock or the tree: the caller stamps a
//! receipt time beforehand and the merge engine resolves conflicts.
//!
//! The entity path comes from the envelope `source` when it contains
//! `real/{r}/stage/{s}/step/{t}/job/{j}` segments, otherwise from the
//! `real`, `stage`, `step`, and `job` keys of `data`, and last from the
//! same keys at the envelope's top level.

use std::collections::BTreeMap;

use ensemble_types::{
    Envelope, EventType, JobEvent, PartialSnapshot, StageEvent, Status, StepEvent,
};

/// Keys that locate an entity and are never copied into job data.
const PATH_KEYS: [&str; 4] = ["real", "stage", "step", "job"];

/// Why an event could not be turned into a diff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    /// The type is not part of the forward-model vocabulary.
    #[error("unrecognized event type {kind:?}")]
    Unrecognized {
        /// The type string as received.
        kind: String,
    },

    /// A path component required by the event category is absent.
    #[error("{kind} event is missing {field}")]
    MissingField {
        /// Event type.
        kind: String,
        /// Name of the missing component.
        field: &'static str,
    },

    /// A field is present but has the wrong shape.
    #[error("{kind} event has invalid {field}: {reason}")]
    InvalidField {
        /// Event type.
        kind: String,
        /// Name of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// Convert a reporter event into the diff it describes.
///
/// # Errors
///
/// Returns [`TranslateError::Unrecognized`] for types outside the
/// forward-model vocabulary, [`TranslateError::MissingField`] when the
/// entity path is incomplete, and [`TranslateError::InvalidField`] when a
/// path component or the payload has the wrong JSON type.
pub fn translate(envelope: &Envelope) -> Result<PartialSnapshot, TranslateError> {
    let event = envelope.event_type();
    let path = EventPath::new(envelope);
    let time = envelope.time;
    let mut diff = PartialSnapshot::default();

    match event {
        EventType::Stage(kind) => {
            let real = path.component("real")?;
            let stage_id = path.component("stage")?;
            let stage = diff.stage_mut(real, stage_id);
            match kind {
                StageEvent::Waiting => stage.status = Some(Status::Waiting),
                StageEvent::Pending => stage.status = Some(Status::Pending),
                StageEvent::Unknown => stage.status = Some(Status::Unknown),
                StageEvent::Running => {
                    stage.status = Some(Status::Running);
                    stage.start_time = time;
                }
                StageEvent::Success => {
                    stage.status = Some(Status::Success);
                    stage.end_time = time;
                }
                StageEvent::Failure => {
                    stage.status = Some(Status::Failure);
                    stage.end_time = time;
                }
            }
        }
        EventType::Step(kind) => {
            let real = path.component("real")?;
            let stage = path.component("stage")?;
            let step_id = path.component("step")?;
            let step = diff.step_mut(real, stage, step_id);
            match kind {
                StepEvent::Start => {
                    step.status = Some(Status::Running);
                    step.start_time = time;
                }
                StepEvent::Success => {
                    step.status = Some(Status::Success);
                    step.end_time = time;
                }
                StepEvent::Failure => {
                    step.status = Some(Status::Failure);
                    step.end_time = time;
                }
            }
        }
        EventType::Job(kind) => {
            let real = path.component("real")?;
            let stage = path.component("stage")?;
            let step = path.component("step")?;
            let job_id = path.component("job")?;
            let payload = match kind {
                JobEvent::Start => BTreeMap::new(),
                JobEvent::Running | JobEvent::Success | JobEvent::Failure => path.payload()?,
            };
            let job = diff.job_mut(real, stage, step, job_id);
            match kind {
                JobEvent::Start => {
                    job.status = Some(Status::Pending);
                    job.start_time = time;
                }
                JobEvent::Running => job.status = Some(Status::Running),
                JobEvent::Success => {
                    job.status = Some(Status::Success);
                    job.end_time = time;
                }
                JobEvent::Failure => {
                    job.status = Some(Status::Failure);
                    job.end_time = time;
                }
            }
            job.data = payload;
        }
        EventType::Unrecognized(kind) => return Err(TranslateError::Unrecognized { kind }),
    }

    Ok(diff)
}

/// Path components and payload of one event.
struct EventPath<'a> {
    kind: &'a str,
    from_source: BTreeMap<&'a str, &'a str>,
    data: &'a serde_json::Value,
    extra: &'a BTreeMap<String, serde_json::Value>,
}

impl<'a> EventPath<'a> {
    fn new(envelope: &'a Envelope) -> Self {
        let segments: Vec<&str> = envelope
            .source
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect();
        let from_source = segments
            .windows(2)
            .filter_map(|pair| match pair {
                [key, value] if PATH_KEYS.contains(key) => Some((*key, *value)),
                _ => None,
            })
            .collect();
        Self {
            kind: &envelope.kind,
            from_source,
            data: &envelope.data,
            extra: &envelope.extra,
        }
    }

    fn component(&self, field: &'static str) -> Result<String, TranslateError> {
        if let Some(value) = self.from_source.get(field) {
            return Ok((*value).to_owned());
        }
        let value = self
            .data
            .get(field)
            .filter(|value| !value.is_null())
            .or_else(|| self.extra.get(field));
        match value {
            Some(serde_json::Value::String(value)) => Ok(value.clone()),
            Some(serde_json::Value::Number(value)) if value.is_u64() || value.is_i64() => {
                Ok(value.to_string())
            }
            Some(serde_json::Value::Null) | None => Err(TranslateError::MissingField {
                kind: self.kind.to_owned(),
                field,
            }),
            Some(other) => Err(TranslateError::InvalidField {
                kind: self.kind.to_owned(),
                field,
                reason: format!("expected a string or integer, got {other}"),
            }),
        }
    }

    /// The job payload: every `data` key except the path keys.
    fn payload(&self) -> Result<BTreeMap<String, serde_json::Value>, TranslateError> {
        match self.data {
            serde_json::Value::Null => Ok(BTreeMap::new()),
            serde_json::Value::Object(map) => Ok(map
                .iter()
                .filter(|(key, _)| !PATH_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()),
            other => Err(TranslateError::InvalidField {
                kind: self.kind.to_owned(),
                field: "data",
                reason: format!("expected an object, got {other}"),
            }),
        }
    }
}
