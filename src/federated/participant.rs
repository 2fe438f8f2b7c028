//! The contract every data holder implements.
//!
//! A participant receives a copy of the global parameters plus a
//! [`TrainingConfig`] and answers with an [`Update`] (fit) or an
//! [`EvaluationResult`] (evaluate). Nothing else crosses the boundary.

use crate::federated::config::TrainingConfig;
use crate::federated::tensor::ParameterVector;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Metric name to value.
pub type MetricMap = BTreeMap<String, f64>;

/// Result type for participant operations.
pub type ParticipantResult<T> = std::result::Result<T, ParticipantError>;

/// Failure reported by a participant.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParticipantError {
    #[error("participant unavailable: {0}")]
    Unavailable(String),

    #[error("rejected parameters: {0}")]
    InvalidParameters(String),

    #[error("local training failed: {0}")]
    Training(String),

    #[error("local evaluation failed: {0}")]
    Evaluation(String),
}

/// A participant's contribution to one fit phase.
///
/// Fields are private: an update is never mutated after creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Update {
    parameters: ParameterVector,
    sample_count: u64,
    metrics: MetricMap,
}

impl Update {
    /// Create an update. `sample_count` must be the number of training
    /// examples actually used; zero is rejected at aggregation time.
    pub fn new(parameters: ParameterVector, sample_count: u64, metrics: MetricMap) -> Self {
        Self {
            parameters,
            sample_count,
            metrics,
        }
    }

    pub fn parameters(&self) -> &ParameterVector {
        &self.parameters
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn metrics(&self) -> &MetricMap {
        &self.metrics
    }
}

/// A participant's answer to an evaluate request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    loss: f64,
    sample_count: u64,
    metrics: MetricMap,
}

impl EvaluationResult {
    /// Create an evaluation result.
    pub fn new(loss: f64, sample_count: u64, metrics: MetricMap) -> Self {
        Self {
            loss,
            sample_count,
            metrics,
        }
    }

    pub fn loss(&self) -> f64 {
        self.loss
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn metrics(&self) -> &MetricMap {
        &self.metrics
    }
}

/// A data holder taking part in federated training.
///
/// Implementations run independently of each other; the coordinator calls
/// them concurrently and never assumes one is reachable across rounds.
#[async_trait]
pub trait Participant: Send + Sync {
    /// Stable identifier, unique within a registry.
    fn id(&self) -> &str;

    /// Train locally starting from `parameters`.
    async fn fit(
        &self,
        parameters: ParameterVector,
        config: TrainingConfig,
    ) -> ParticipantResult<Update>;

    /// Evaluate `parameters` on local held-out data.
    ///
    /// Must not change any state that affects later rounds.
    async fn evaluate(
        &self,
        parameters: ParameterVector,
        config: TrainingConfig,
    ) -> ParticipantResult<EvaluationResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_accessors() {
        let mut metrics = MetricMap::new();
        metrics.insert("accuracy".into(), 0.9);
        let update = Update::new(ParameterVector::from_scalars(&[1.0]), 12, metrics);
        assert_eq!(update.sample_count(), 12);
        assert_eq!(update.parameters().len(), 1);
        assert_eq!(update.metrics().get("accuracy"), Some(&0.9));
    }

    #[test]
    fn test_evaluation_result_accessors() {
        let result = EvaluationResult::new(0.4, 8, MetricMap::new());
        assert_eq!(result.loss(), 0.4);
        assert_eq!(result.sample_count(), 8);
        assert!(result.metrics().is_empty());
    }

    #[test]
    fn test_participant_error_display() {
        let err = ParticipantError::Training("diverged".into());
        assert_eq!(err.to_string(), "local training failed: diverged");
    }
}
