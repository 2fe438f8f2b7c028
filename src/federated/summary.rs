//! Per-round outcome records.

use crate::core::{now, Error, Hash256, Phase, Timestamp};
use crate::federated::participant::MetricMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error as ThisError;

/// Why a single participant did not contribute.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FailureKind {
    /// No answer before the phase deadline
    Timeout,
    /// The participant reported an error
    Error(String),
    /// The participant's task panicked or was cancelled
    Aborted(String),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Timeout => write!(f, "timed out"),
            FailureKind::Error(msg) => write!(f, "error: {}", msg),
            FailureKind::Aborted(msg) => write!(f, "aborted: {}", msg),
        }
    }
}

/// One participant failure within a round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParticipantFailure {
    pub participant_id: String,
    pub phase: Phase,
    pub kind: FailureKind,
}

impl ParticipantFailure {
    pub fn new(participant_id: &str, phase: Phase, kind: FailureKind) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            phase,
            kind,
        }
    }
}

/// Whether the fit phase changed the global model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RoundStatus {
    /// New parameters were committed
    Committed,
    /// Nothing was committed
    Failed {
        reason: String,
        /// A participant broke its contract (bad shapes, zero samples)
        contract_violation: bool,
    },
}

/// Outcome of the evaluation sub-phase.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EvaluationStatus {
    /// Fit failed, so there was nothing to evaluate
    NotRun,
    /// Disabled by configuration
    Skipped,
    /// Loss and metrics were aggregated
    Aggregated,
    /// Evaluation failed; the fit commit stands
    Failed { reason: String },
}

/// Append-only record of one round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round_index: u64,
    pub status: RoundStatus,
    /// Fit updates that went into aggregation (0 when the round failed)
    pub participants_used: usize,
    /// Participants asked to fit
    pub fit_selected: usize,
    pub evaluation: EvaluationStatus,
    /// Evaluations that went into the aggregated loss
    pub evaluated_by: usize,
    /// Aggregated evaluation loss
    pub loss: Option<f64>,
    /// Aggregated evaluation metrics
    pub metrics: MetricMap,
    /// Aggregated fit metrics
    pub fit_metrics: MetricMap,
    /// Every participant failure in either phase
    pub failures: Vec<ParticipantFailure>,
    /// Global model version after this round
    pub model_version: u64,
    /// Fingerprint of the committed parameters
    pub model_fingerprint: Option<Hash256>,
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
}

impl RoundSummary {
    pub fn is_committed(&self) -> bool {
        self.status == RoundStatus::Committed
    }

    /// Failures recorded for one phase.
    pub fn failures_in(&self, phase: Phase) -> impl Iterator<Item = &ParticipantFailure> {
        self.failures.iter().filter(move |f| f.phase == phase)
    }

    /// Wall-clock duration of the round.
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// A round that committed nothing.
#[derive(Debug, ThisError)]
#[error("round {round_index} failed: {error}")]
pub struct RoundError {
    pub round_index: u64,
    #[source]
    pub error: Error,
    /// Participants asked to fit
    pub fit_selected: usize,
    /// Participant failures seen before the round was abandoned
    pub failures: Vec<ParticipantFailure>,
    /// Unchanged global model version
    pub model_version: u64,
    pub started_at: Timestamp,
}

impl RoundError {
    /// Record of the failed round, with zero participants used.
    pub fn into_summary(self) -> RoundSummary {
        RoundSummary {
            round_index: self.round_index,
            status: RoundStatus::Failed {
                reason: self.error.to_string(),
                contract_violation: self.error.is_contract_violation(),
            },
            participants_used: 0,
            fit_selected: self.fit_selected,
            evaluation: EvaluationStatus::NotRun,
            evaluated_by: 0,
            loss: None,
            metrics: MetricMap::new(),
            fit_metrics: MetricMap::new(),
            failures: self.failures,
            model_version: self.model_version,
            model_fingerprint: None,
            started_at: self.started_at,
            finished_at: now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_error_into_summary() {
        let err = RoundError {
            round_index: 2,
            error: Error::QuorumNotMet {
                phase: Phase::Fit,
                succeeded: 1,
                required: 2,
            },
            fit_selected: 3,
            failures: vec![
                ParticipantFailure::new("drone2", Phase::Fit, FailureKind::Timeout),
                ParticipantFailure::new("drone3", Phase::Fit, FailureKind::Error("io".into())),
            ],
            model_version: 2,
            started_at: now(),
        };
        let summary = err.into_summary();

        assert!(!summary.is_committed());
        assert_eq!(summary.participants_used, 0);
        assert_eq!(summary.fit_selected, 3);
        assert_eq!(summary.failures_in(Phase::Fit).count(), 2);
        assert_eq!(summary.evaluation, EvaluationStatus::NotRun);
        assert!(matches!(
            summary.status,
            RoundStatus::Failed {
                contract_violation: false,
                ..
            }
        ));
    }

    #[test]
    fn test_failure_kind_display() {
        assert_eq!(FailureKind::Timeout.to_string(), "timed out");
        assert_eq!(FailureKind::Error("boom".into()).to_string(), "error: boom");
    }
}
