//! Error types for dronefed.

use std::fmt;
use thiserror::Error;

/// Result type alias for dronefed operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Phase of a round a failure belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Phase {
    /// Local training and parameter aggregation
    Fit,
    /// Evaluation of the newly aggregated parameters
    Evaluate,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Fit => write!(f, "fit"),
            Phase::Evaluate => write!(f, "evaluate"),
        }
    }
}

/// Errors that can occur in dronefed operations.
#[derive(Error, Debug)]
pub enum Error {
    // Round-level failures
    #[error("Insufficient participants: {available} available, {required} required")]
    InsufficientParticipants { available: usize, required: usize },

    #[error("Quorum not met in {phase} phase: {succeeded} succeeded, {required} required")]
    QuorumNotMet {
        phase: Phase,
        succeeded: usize,
        required: usize,
    },

    // Contract violations
    /// `None` on either side means that side has no tensor at `index`.
    #[error(
        "Shape mismatch at tensor {index}: expected {}, got {}",
        shape_text(.expected),
        shape_text(.actual)
    )]
    ShapeMismatch {
        index: usize,
        expected: Option<Vec<usize>>,
        actual: Option<Vec<usize>>,
    },

    #[error("Aggregation called with no inputs")]
    EmptyAggregationSet,

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    // Configuration and collaborators
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Checkpoint failed: {0}")]
    Checkpoint(String),

    #[error("Dataset error: {0}")]
    Dataset(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error signals a participant breaching its contract
    /// (bad shapes, zero sample counts) or a violated coordinator invariant.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::ShapeMismatch { .. } | Error::EmptyAggregationSet
                | Error::InvalidUpdate(_)
        )
    }

    /// Whether this error is an availability failure scoped to one round.
    pub fn is_availability_failure(&self) -> bool {
        matches!(
            self,
            Error::InsufficientParticipants { .. } | Error::QuorumNotMet { .. }
        )
    }
}

fn shape_text(shape: &Option<Vec<usize>>) -> String {
    match shape {
        Some(dims) => format!("{:?}", dims),
        None => "no tensor".to_string(),
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_violation_classification() {
        assert!(Error::EmptyAggregationSet.is_contract_violation());
        assert!(Error::InvalidUpdate("zero samples".into()).is_contract_violation());
        assert!(Error::ShapeMismatch {
            index: 0,
            expected: Some(vec![2]),
            actual: Some(vec![3]),
        }
        .is_contract_violation());
        assert!(!Error::QuorumNotMet {
            phase: Phase::Fit,
            succeeded: 1,
            required: 2,
        }
        .is_contract_violation());
    }

    #[test]
    fn test_availability_classification() {
        let err = Error::InsufficientParticipants {
            available: 1,
            required: 2,
        };
        assert!(err.is_availability_failure());
        assert!(!Error::EmptyAggregationSet.is_availability_failure());
    }

    #[test]
    fn test_error_display() {
        let err = Error::QuorumNotMet {
            phase: Phase::Evaluate,
            succeeded: 1,
            required: 2,
        };
        assert_eq!(
            err.to_string(),
            "Quorum not met in evaluate phase: 1 succeeded, 2 required"
        );

        let err = Error::ShapeMismatch {
            index: 1,
            expected: Some(vec![2, 3]),
            actual: None,
        };
        assert_eq!(
            err.to_string(),
            "Shape mismatch at tensor 1: expected [2, 3], got no tensor"
        );
    }
}
