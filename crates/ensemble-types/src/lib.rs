//! Shared type definitions for the ensemble evaluator.
//!
//! This crate is the single source of truth for the state tree, its sparse
//! diffs, and the wire envelope exchanged with observers and reporters.
//! Types flow downstream to `TypeScript` via `ts-rs` for dashboard
//! observers.
//!
//! # Modules
//!
//! - [`ids`] -- Identifier newtypes for tree entities and connections
//! - [`enums`] -- Status, ensemble status, and queue state enumerations
//! - [`snapshot`] -- The canonical state tree ([`Snapshot`])
//! - [`partial`] -- Sparse diffs over the tree ([`PartialSnapshot`])
//! - [`envelope`] -- Wire envelope and forward-model event vocabulary

pub mod enums;
pub mod envelope;
pub mod ids;
pub mod partial;
pub mod snapshot;

// Re-export all public types at crate root for convenience.
pub use enums::{EnsembleStatus, QueueState, Status};
pub use envelope::{Envelope, EventType, JobEvent, StageEvent, StepEvent, evaluator_source};
pub use ids::{ConnectionId, JobId, RealId, StageId, StepId};
pub use partial::{PartialJob, PartialRealization, PartialSnapshot, PartialStage, PartialStep};
pub use snapshot::{Job, Realization, Snapshot, Stage, Step};
