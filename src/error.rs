//! Error types for the partition control plane.

use crate::types::{ClusterKey, PartitionId};
use smol_str::SmolStr;
use std::io;
use thiserror::Error;

/// Result type alias for control-plane operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the control plane.
///
/// Variants map onto the error taxonomy of the admin surface: malformed
/// requests and precondition violations are handled at the command boundary,
/// stale-key races are reported rather than silently producing a wrong
/// answer, and durable-state corruption must never be swallowed.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request parameter, rejected before touching any state.
    #[error("bad parameter: {0}")]
    BadParam(#[from] ParamError),

    /// A precondition for the operation does not hold; nothing was mutated.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The cluster key advanced while the operation was in flight.
    #[error("stale cluster key: planned {planned}, live {live}")]
    StaleKey {
        planned: ClusterKey,
        live: ClusterKey,
    },

    /// Strong-consistency-only operation issued on an AP namespace.
    #[error("strong-consistency only: {0}")]
    StrongConsistencyOnly(&'static str),

    /// Namespace name does not match any configured namespace.
    #[error("unknown namespace: {0}")]
    UnknownNamespace(SmolStr),

    /// Partition index out of range for the namespace.
    #[error("unknown partition: {0}")]
    UnknownPartition(PartitionId),

    /// Durable state failed validation on load. Callers must treat this as
    /// fatal: propagating wrong ownership is worse than stopping.
    #[error("durable state corrupt: {0}")]
    Corrupt(String),

    /// Transport-level failure talking to a peer.
    #[error("fabric error: {0}")]
    Fabric(String),

    /// Storage engine failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization failure on a wire or durable payload.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The engine is shutting down.
    #[error("shutting down")]
    Shutdown,
}

/// Errors produced by the admin-protocol parameter parser.
///
/// Mirrors the taxonomy of the request surface: a parameter is either
/// absent, over the per-key length budget, or present but unparseable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
    /// Required parameter was not supplied.
    #[error("missing parameter: {0}")]
    Missing(&'static str),

    /// Parameter value exceeds the per-key length budget.
    #[error("parameter {key} too long (max {max})")]
    TooLong { key: &'static str, max: usize },

    /// Parameter value failed to parse.
    #[error("malformed parameter {key}: {value}")]
    Malformed { key: &'static str, value: String },
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::StaleKey {
            planned: ClusterKey::new(1),
            live: ClusterKey::new(2),
        };
        assert_eq!(err.to_string(), "stale cluster key: planned 1, live 2");

        let err = Error::BadParam(ParamError::Missing("namespace"));
        assert_eq!(err.to_string(), "bad parameter: missing parameter: namespace");
    }

    #[test]
    fn test_param_error_eq() {
        assert_eq!(
            ParamError::TooLong { key: "size", max: 3 },
            ParamError::TooLong { key: "size", max: 3 },
        );
    }
}
