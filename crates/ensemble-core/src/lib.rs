//! State merging, event translation, and shutdown accounting for the
//! ensemble evaluator.
//!
//! This crate holds the evaluator's logic that does not touch the network:
//! how reporter events become diffs, how diffs are merged into the state
//! tree, how outbound events are numbered, and how shutdown waits for
//! reporters to finish.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `ensemble-config.yaml` into
//!   strongly-typed structs.
//! - [`drain`] -- [`DrainController`] reporter counter with bounded wait.
//! - [`index`] -- [`EventIndex`] outbound event numbering.
//! - [`merge`] -- [`apply_update`] with the status precedence rule.
//! - [`topology`] -- [`Ensemble`] collaborator trait and initial tree
//!   construction.
//! - [`translate`] -- Reporter event to diff translation.
//!
//! [`DrainController`]: drain::DrainController
//! [`EventIndex`]: index::EventIndex
//! [`apply_update`]: merge::apply_update
//! [`Ensemble`]: topology::Ensemble

pub mod config;
pub mod drain;
pub mod index;
pub mod merge;
pub mod topology;
pub mod translate;
