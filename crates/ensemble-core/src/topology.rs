//! Ensemble topology and the collaborator that runs it.
//!
//! The evaluator does not compute anything itself. An [`Ensemble`]
//! implementation supplies the static realization/stage/step/job
//! structure, run metadata, and the start signal that launches the
//! distributed execution once the listener address is known.
//!
//! [`build_snapshot`] turns a [`Topology`] into the initial state tree.
//! [`StaticEnsemble`] is the configuration-driven implementation used by
//! the service binary and the tests.

use std::collections::BTreeMap;

use ensemble_types::{
    EnsembleStatus, Job, JobId, QueueState, RealId, Realization, Snapshot, Stage, StageId, Status,
    Step, StepId,
};

use crate::config::EnsembleSpec;

/// Errors raised by topology validation or the start signal.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// Two entities share an id within the same parent.
    #[error("duplicate {kind} id {id:?} under {parent}")]
    DuplicateId {
        /// Entity kind (realization, stage, step, job).
        kind: &'static str,
        /// The repeated id.
        id: String,
        /// Path of the parent entity.
        parent: String,
    },

    /// The collaborator failed to start the evaluation.
    #[error("failed to start ensemble evaluation: {message}")]
    Start {
        /// Description of the failure.
        message: String,
    },
}

/// Static structure of one realization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealizationTopology {
    /// Realization index.
    pub id: RealId,
    /// Whether the realization takes part in the run.
    pub active: bool,
    /// Stages in execution order.
    pub stages: Vec<StageTopology>,
}

/// Static structure of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTopology {
    /// Stage id.
    pub id: StageId,
    /// Steps in execution order.
    pub steps: Vec<StepTopology>,
}

/// Static structure of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepTopology {
    /// Step id.
    pub id: StepId,
    /// Jobs in execution order.
    pub jobs: Vec<JobTopology>,
}

/// Static description of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobTopology {
    /// Job id.
    pub id: JobId,
    /// Display name.
    pub name: String,
}

/// The whole static structure of an ensemble.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    /// Realizations in index order.
    pub realizations: Vec<RealizationTopology>,
}

impl Topology {
    /// Build the uniform topology described by a config section: `size`
    /// realizations, each with the same stages, steps, and jobs. Job ids
    /// are their positions within the step.
    pub fn from_spec(spec: &EnsembleSpec) -> Self {
        let stages: Vec<StageTopology> = spec
            .stages
            .iter()
            .map(|stage| StageTopology {
                id: StageId::from(stage.id.as_str()),
                steps: stage
                    .steps
                    .iter()
                    .map(|step| StepTopology {
                        id: StepId::from(step.id.as_str()),
                        jobs: step
                            .jobs
                            .iter()
                            .enumerate()
                            .map(|(index, name)| JobTopology {
                                id: JobId::from(index),
                                name: name.clone(),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        let realizations = (0..spec.size)
            .map(|index| RealizationTopology {
                id: RealId::from(index),
                active: true,
                stages: stages.clone(),
            })
            .collect();

        Self { realizations }
    }

    /// Check that ids are unique within each parent.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::DuplicateId`] for the first repeat found.
    pub fn validate(&self) -> Result<(), TopologyError> {
        check_unique("realization", "ensemble", self.realizations.iter().map(|r| r.id.as_str()))?;
        for real in &self.realizations {
            let real_path = format!("real/{}", real.id);
            check_unique("stage", &real_path, real.stages.iter().map(|s| s.id.as_str()))?;
            for stage in &real.stages {
                let stage_path = format!("{real_path}/stage/{}", stage.id);
                check_unique("step", &stage_path, stage.steps.iter().map(|s| s.id.as_str()))?;
                for step in &stage.steps {
                    let step_path = format!("{stage_path}/step/{}", step.id);
                    check_unique("job", &step_path, step.jobs.iter().map(|j| j.id.as_str()))?;
                }
            }
        }
        Ok(())
    }
}

fn check_unique<'a>(
    kind: &'static str,
    parent: &str,
    ids: impl Iterator<Item = &'a str>,
) -> Result<(), TopologyError> {
    let mut seen = std::collections::BTreeSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(TopologyError::DuplicateId {
                kind,
                id: id.to_owned(),
                parent: parent.to_owned(),
            });
        }
    }
    Ok(())
}

/// Build the initial state tree for a topology.
///
/// Every stage, step, and job starts `Unknown` with null timestamps;
/// every realization starts active in the `JOB_QUEUE_RUNNING` queue
/// state. The root status is `Unknown` until the evaluator starts.
pub fn build_snapshot(
    topology: &Topology,
    metadata: BTreeMap<String, serde_json::Value>,
) -> Snapshot {
    let reals = topology
        .realizations
        .iter()
        .map(|real| {
            let stages = real
                .stages
                .iter()
                .map(|stage| {
                    let steps = stage
                        .steps
                        .iter()
                        .map(|step| {
                            let jobs = step
                                .jobs
                                .iter()
                                .map(|job| {
                                    let node = Job {
                                        status: Status::Unknown,
                                        name: job.name.clone(),
                                        start_time: None,
                                        end_time: None,
                                        data: BTreeMap::new(),
                                    };
                                    (job.id.clone(), node)
                                })
                                .collect();
                            (step.id.clone(), Step { jobs, ..Step::default() })
                        })
                        .collect();
                    (stage.id.clone(), Stage { steps, ..Stage::default() })
                })
                .collect();
            let node = Realization {
                active: real.active,
                start_time: None,
                end_time: None,
                queue_state: QueueState::JobQueueRunning,
                stages,
            };
            (real.id.clone(), node)
        })
        .collect();

    Snapshot {
        reals,
        status: EnsembleStatus::Unknown,
        metadata,
    }
}

/// Where the evaluator is listening, handed to [`Ensemble::evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluatorEndpoint {
    /// Host the listener is bound to.
    pub host: String,
    /// Port the listener is bound to.
    pub port: u16,
    /// Evaluator instance id.
    pub evaluator_id: String,
}

impl EvaluatorEndpoint {
    /// URL observers connect to.
    pub fn client_url(&self) -> String {
        format!("ws://{}:{}/client", self.host, self.port)
    }

    /// URL reporters connect to.
    pub fn dispatch_url(&self) -> String {
        format!("ws://{}:{}/dispatch", self.host, self.port)
    }
}

/// The external collaborator that owns the ensemble run.
///
/// The evaluator reads the topology and metadata once, synchronously,
/// before it starts listening. [`evaluate`](Ensemble::evaluate) is called
/// after the listener is bound, so reporters launched by the collaborator
/// always find the service up.
pub trait Ensemble: Send + Sync {
    /// Static structure of the ensemble.
    fn topology(&self) -> Topology;

    /// Run metadata copied into the snapshot root.
    fn metadata(&self) -> BTreeMap<String, serde_json::Value>;

    /// Start the distributed execution. Reporters should connect to
    /// [`EvaluatorEndpoint::dispatch_url`].
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::Start`] if the run cannot be launched.
    fn evaluate(&self, endpoint: &EvaluatorEndpoint) -> Result<(), TopologyError>;
}

/// An [`Ensemble`] with a fixed topology and no execution backend.
///
/// `evaluate` only logs the dispatch URL; reporters are expected to be
/// started by something else (a queue driver, a test harness).
#[derive(Debug, Clone, Default)]
pub struct StaticEnsemble {
    topology: Topology,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl StaticEnsemble {
    /// Create an ensemble from an explicit topology.
    pub const fn new(topology: Topology, metadata: BTreeMap<String, serde_json::Value>) -> Self {
        Self { topology, metadata }
    }

    /// Create an ensemble from the `ensemble` config section.
    pub fn from_spec(spec: &EnsembleSpec) -> Self {
        Self::new(Topology::from_spec(spec), spec.metadata.clone())
    }
}

impl Ensemble for StaticEnsemble {
    fn topology(&self) -> Topology {
        self.topology.clone()
    }

    fn metadata(&self) -> BTreeMap<String, serde_json::Value> {
        self.metadata.clone()
    }

    fn evaluate(&self, endpoint: &EvaluatorEndpoint) -> Result<(), TopologyError> {
        tracing::info!(
            dispatch_url = %endpoint.dispatch_url(),
            realizations = self.topology.realizations.len(),
            "Ensemble ready for reporters"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{StageSpec, StepSpec};

    fn spec(size: usize) -> EnsembleSpec {
        EnsembleSpec {
            size,
            stages: vec![StageSpec {
                id: String::from("0"),
                steps: vec![StepSpec {
                    id: String::from("0"),
                    jobs: vec![String::from("FWD_MODEL"), String::from("POST")],
                }],
            }],
            metadata: BTreeMap::from([(String::from("iter"), serde_json::json!(0))]),
        }
    }

    #[test]
    fn initial_tree_matches_topology() {
        let topology = Topology::from_spec(&spec(3));
        let tree = build_snapshot(&topology, BTreeMap::new());

        assert_eq!(tree.reals.len(), 3);
        assert_eq!(tree.status, EnsembleStatus::Unknown);
        assert_eq!(tree.jobs().count(), 6);
        for (_, _, _, _, job) in tree.jobs() {
            assert_eq!(job.status, Status::Unknown);
            assert!(job.start_time.is_none());
            assert!(job.end_time.is_none());
            assert!(job.data.is_empty());
        }
        for real in tree.reals.values() {
            assert!(real.active);
            assert_eq!(real.queue_state, QueueState::JobQueueRunning);
            assert!(real.start_time.is_none());
            for stage in real.stages.values() {
                assert_eq!(stage.status, Status::Unknown);
                for step in stage.steps.values() {
                    assert_eq!(step.status, Status::Unknown);
                }
            }
        }
        assert_eq!(
            tree.job("2", "0", "0", "1").map(|j| j.name.as_str()),
            Some("POST")
        );
    }

    #[test]
    fn single_job_topology() {
        let mut single = spec(1);
        if let Some(step) = single.stages.get_mut(0).and_then(|s| s.steps.get_mut(0)) {
            step.jobs = vec![String::from("FWD_MODEL")];
        }
        let tree = build_snapshot(&Topology::from_spec(&single), BTreeMap::new());
        assert_eq!(tree.jobs().count(), 1);
        assert_eq!(
            tree.job("0", "0", "0", "0").map(|j| j.name.as_str()),
            Some("FWD_MODEL")
        );
    }

    #[test]
    fn empty_spec_builds_empty_tree() {
        let tree = build_snapshot(&Topology::from_spec(&EnsembleSpec::default()), BTreeMap::new());
        assert!(tree.reals.is_empty());
    }

    #[test]
    fn duplicate_ids_are_reported() {
        let mut topology = Topology::from_spec(&spec(1));
        let real = topology.realizations.first_mut().unwrap();
        let stage = real.stages.first().cloned().unwrap();
        real.stages.push(stage);
        let err = topology.validate().unwrap_err();
        assert!(matches!(err, TopologyError::DuplicateId { kind: "stage", .. }));
        assert!(Topology::from_spec(&spec(4)).validate().is_ok());
    }

    #[test]
    fn static_ensemble_exposes_metadata() {
        let ensemble = StaticEnsemble::from_spec(&spec(2));
        assert_eq!(ensemble.metadata().get("iter"), Some(&serde_json::json!(0)));
        assert_eq!(ensemble.topology().realizations.len(), 2);
        let endpoint = EvaluatorEndpoint {
            host: String::from("127.0.0.1"),
            port: 9000,
            evaluator_id: String::from("0"),
        };
        assert!(ensemble.evaluate(&endpoint).is_ok());
        assert_eq!(endpoint.dispatch_url(), "ws://127.0.0.1:9000/dispatch");
        assert_eq!(endpoint.client_url(), "ws://127.0.0.1:9000/client");
    }
}
