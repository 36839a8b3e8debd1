//! Type-safe identifiers for state tree entities and connections.
//!
//! Tree entities (realizations, stages, steps, jobs) are keyed by short
//! strings that are unique within their parent's scope. Realizations use
//! their ensemble index rendered as a string (`"0"`, `"1"`, ...). Wrapping
//! each in its own newtype prevents passing a stage id where a job id is
//! expected.
//!
//! Connections get a [`Uuid`] v7 so log lines sort by connect time.

use std::borrow::Borrow;

use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

/// Generates a string-keyed newtype used as a map key in the state tree.
macro_rules! define_key {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
        #[ts(export, export_to = "bindings/")]
        pub struct $name(pub String);

        impl $name {
            /// Create an identifier from anything string-like.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Borrow the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<usize> for $name {
            fn from(index: usize) -> Self {
                Self(index.to_string())
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

define_key! {
    /// Index of a realization (ensemble member), rendered as a string.
    RealId
}

define_key! {
    /// Identifier of a stage, unique within its realization.
    StageId
}

define_key! {
    /// Identifier of a step, unique within its stage.
    StepId
}

define_key! {
    /// Identifier of a job, unique within its step.
    JobId
}

/// Unique identifier for a live observer or reporter connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new identifier using UUID v7 (time-ordered).
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}
