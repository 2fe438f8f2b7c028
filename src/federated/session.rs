//! Multi-round training lifecycle.

use crate::core::Result;
use crate::federated::aggregator::Aggregation;
use crate::federated::checkpoint::{Checkpoint, CheckpointWriter, FileCheckpointWriter};
use crate::federated::config::SessionConfig;
use crate::federated::coordinator::RoundCoordinator;
use crate::federated::registry::ParticipantRegistry;
use crate::federated::state::GlobalModelState;
use crate::federated::summary::RoundSummary;
use crate::federated::tensor::ParameterVector;
use crate::monitoring::metrics::RoundMetrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Final model and full round history of a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    /// Last committed global model
    pub final_state: GlobalModelState,
    /// One summary per attempted round, in order
    pub history: Vec<RoundSummary>,
}

impl SessionReport {
    /// Rounds that committed new parameters.
    pub fn committed_rounds(&self) -> impl Iterator<Item = &RoundSummary> {
        self.history.iter().filter(|s| s.is_committed())
    }

    /// Rounds that committed nothing.
    pub fn failed_rounds(&self) -> impl Iterator<Item = &RoundSummary> {
        self.history.iter().filter(|s| !s.is_committed())
    }

    /// Serialize the report as JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Runs a fixed number of rounds against a registry.
///
/// A failed round is recorded and the next one starts anyway; the session
/// always attempts every round it was asked to run.
pub struct TrainingSession {
    id: Uuid,
    config: SessionConfig,
    coordinator: RoundCoordinator,
    registry: ParticipantRegistry,
    initial_parameters: ParameterVector,
    checkpoint_writer: Option<Arc<dyn CheckpointWriter>>,
    metrics: Arc<RoundMetrics>,
}

impl TrainingSession {
    /// Create a session. Fails only on invalid configuration.
    pub fn new(
        config: SessionConfig,
        registry: ParticipantRegistry,
        initial_parameters: ParameterVector,
    ) -> Result<Self> {
        config.validate()?;
        let coordinator = RoundCoordinator::new(config.strategy.clone())?;
        let checkpoint_writer = config.checkpoint_dir.as_ref().map(|dir| {
            Arc::new(FileCheckpointWriter::new(dir.clone())) as Arc<dyn CheckpointWriter>
        });

        Ok(Self {
            id: Uuid::new_v4(),
            config,
            coordinator,
            registry,
            initial_parameters,
            checkpoint_writer,
            metrics: Arc::new(RoundMetrics::new()),
        })
    }

    /// Use different aggregation functions.
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.coordinator = self.coordinator.with_aggregation(aggregation);
        self
    }

    /// Send checkpoints somewhere other than the configured directory.
    pub fn with_checkpoint_writer(mut self, writer: Arc<dyn CheckpointWriter>) -> Self {
        self.checkpoint_writer = Some(writer);
        self
    }

    /// Share a metrics collector with the caller.
    pub fn with_metrics(mut self, metrics: Arc<RoundMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> Arc<RoundMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run the configured number of rounds.
    pub async fn run_configured(self) -> SessionReport {
        let num_rounds = self.config.num_rounds;
        self.run(num_rounds).await
    }

    /// Run rounds `0..num_rounds` sequentially.
    ///
    /// Round `r + 1` starts only after round `r` has finished both phases.
    pub async fn run(self, num_rounds: u64) -> SessionReport {
        let mut state = GlobalModelState::new(self.initial_parameters.clone());
        let mut history = Vec::with_capacity(num_rounds as usize);

        info!(
            session = %self.id,
            rounds = num_rounds,
            parameters = state.parameters().parameter_count(),
            "training session starting"
        );

        for round_index in 0..num_rounds {
            let summary = match self
                .coordinator
                .run_round(&mut state, &self.registry, round_index)
                .await
            {
                Ok(summary) => summary,
                Err(err) => {
                    if err.error.is_availability_failure() {
                        warn!(round = round_index, error = %err.error, "round failed");
                    } else {
                        error!(round = round_index, error = %err.error, "round aborted");
                    }
                    err.into_summary()
                }
            };

            self.metrics
                .record_round(&summary, self.registry.len().await);
            self.checkpoint(&summary, &state).await;
            history.push(summary);
        }

        let committed = history.iter().filter(|s| s.is_committed()).count();
        info!(
            session = %self.id,
            committed,
            failed = history.len() - committed,
            version = state.version(),
            "training session finished"
        );

        SessionReport {
            session_id: self.id,
            final_state: state,
            history,
        }
    }

    async fn checkpoint(&self, summary: &RoundSummary, state: &GlobalModelState) {
        let Some(writer) = &self.checkpoint_writer else {
            return;
        };
        if !self.config.checkpoint_policy.should_write(summary) {
            return;
        }
        let checkpoint = Checkpoint::capture(summary, state);
        match writer.write(&checkpoint).await {
            Ok(location) => {
                info!(round = summary.round_index, %location, "checkpoint written")
            }
            Err(err) => {
                warn!(round = summary.round_index, error = %err, "checkpoint failed")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federated::checkpoint::CheckpointPolicy;
    use crate::federated::config::{StrategyConfig, TrainingConfig};
    use crate::federated::participant::{
        EvaluationResult, MetricMap, Participant, ParticipantResult, Update,
    };
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Moves every parameter one step toward `target`.
    struct Stepper {
        id: String,
        target: f32,
    }

    #[async_trait]
    impl Participant for Stepper {
        fn id(&self) -> &str {
            &self.id
        }

        async fn fit(
            &self,
            parameters: ParameterVector,
            _config: TrainingConfig,
        ) -> ParticipantResult<Update> {
            let tensors = parameters
                .into_tensors()
                .into_iter()
                .map(|t| t.mapv(|v| v + (self.target - v) * 0.5))
                .collect();
            Ok(Update::new(ParameterVector::new(tensors), 4, MetricMap::new()))
        }

        async fn evaluate(
            &self,
            _parameters: ParameterVector,
            _config: TrainingConfig,
        ) -> ParticipantResult<EvaluationResult> {
            Ok(EvaluationResult::new(0.1, 4, MetricMap::new()))
        }
    }

    #[derive(Default)]
    struct MemoryWriter {
        rounds: Mutex<Vec<(u64, bool)>>,
    }

    #[async_trait]
    impl CheckpointWriter for MemoryWriter {
        async fn write(&self, checkpoint: &Checkpoint) -> Result<String> {
            self.rounds
                .lock()
                .unwrap()
                .push((checkpoint.round_index, checkpoint.committed));
            Ok(format!("memory://{}", checkpoint.round_index))
        }
    }

    fn config() -> SessionConfig {
        SessionConfig::default().with_strategy(
            StrategyConfig::default().with_timeout(Duration::from_millis(200)),
        )
    }

    async fn two_steppers() -> ParticipantRegistry {
        let registry = ParticipantRegistry::new();
        for id in ["drone1", "drone2"] {
            registry
                .join(Arc::new(Stepper {
                    id: id.to_string(),
                    target: 1.0,
                }))
                .await;
        }
        registry
    }

    #[tokio::test]
    async fn test_run_commits_every_round() {
        let session = TrainingSession::new(
            config(),
            two_steppers().await,
            ParameterVector::from_scalars(&[0.0]),
        )
        .unwrap();

        let report = session.run(3).await;

        assert_eq!(report.history.len(), 3);
        assert_eq!(report.committed_rounds().count(), 3);
        assert_eq!(report.final_state.version(), 3);
        // 0 -> 0.5 -> 0.75 -> 0.875
        assert_eq!(report.final_state.parameters().tensors()[0][[0]], 0.875);
    }

    #[tokio::test]
    async fn test_failed_rounds_are_recorded_and_session_continues() {
        let registry = ParticipantRegistry::new();
        let session =
            TrainingSession::new(config(), registry, ParameterVector::from_scalars(&[0.0]))
                .unwrap();
        let metrics = session.metrics();

        let report = session.run(4).await;

        assert_eq!(report.history.len(), 4);
        assert_eq!(report.failed_rounds().count(), 4);
        assert!(report.history.iter().all(|s| s.participants_used == 0));
        assert_eq!(report.final_state.version(), 0);
        assert_eq!(metrics.rounds_failed.get(), 4);
    }

    /// Leaves the registry as soon as it has evaluated once.
    struct Leaver {
        registry: ParticipantRegistry,
    }

    #[async_trait]
    impl Participant for Leaver {
        fn id(&self) -> &str {
            "leaver"
        }

        async fn fit(
            &self,
            parameters: ParameterVector,
            _config: TrainingConfig,
        ) -> ParticipantResult<Update> {
            Ok(Update::new(parameters, 4, MetricMap::new()))
        }

        async fn evaluate(
            &self,
            _parameters: ParameterVector,
            _config: TrainingConfig,
        ) -> ParticipantResult<EvaluationResult> {
            self.registry.leave("leaver").await;
            Ok(EvaluationResult::new(0.1, 4, MetricMap::new()))
        }
    }

    #[tokio::test]
    async fn test_checkpoint_policy_applied() {
        let registry = ParticipantRegistry::new();
        registry
            .join(Arc::new(Stepper {
                id: "drone1".to_string(),
                target: 1.0,
            }))
            .await;
        registry
            .join(Arc::new(Leaver {
                registry: registry.clone(),
            }))
            .await;

        let writer = Arc::new(MemoryWriter::default());
        let mut session_config = config();
        session_config.checkpoint_policy = CheckpointPolicy::EveryRound;
        let session = TrainingSession::new(
            session_config,
            registry,
            ParameterVector::from_scalars(&[0.0]),
        )
        .unwrap()
        .with_checkpoint_writer(writer.clone());

        let report = session.run(2).await;

        assert!(report.history[0].is_committed());
        assert!(!report.history[1].is_committed());
        let rounds = writer.rounds.lock().unwrap().clone();
        assert_eq!(rounds, vec![(0, true), (1, false)]);
    }

    #[tokio::test]
    async fn test_report_to_json() {
        let session = TrainingSession::new(
            config(),
            two_steppers().await,
            ParameterVector::from_scalars(&[0.0]),
        )
        .unwrap();
        let report = session.run(1).await;
        let json = report.to_json().unwrap();
        assert!(json.contains("\"round_index\": 0"));
        assert!(json.contains(&report.session_id.to_string()));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut bad = config();
        bad.strategy.min_fit_clients = 0;
        let result = TrainingSession::new(
            bad,
            ParticipantRegistry::new(),
            ParameterVector::from_scalars(&[0.0]),
        );
        assert!(result.is_err());
    }
}
