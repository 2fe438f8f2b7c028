//! A drone taking part in federated training with its own telemetry.
//!
//! Raw windows never leave this type: `fit` returns weights and a sample
//! count, `evaluate` returns a loss and an accuracy.

use crate::core::Result;
use crate::federated::config::TrainingConfig;
use crate::federated::participant::{
    EvaluationResult, MetricMap, Participant, ParticipantError, ParticipantResult, Update,
};
use crate::federated::tensor::ParameterVector;
use crate::local::dataset::{SensorRecord, SequenceDataset};
use crate::local::model::LocalModel;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Participant-side defaults, overridden per round by [`TrainingConfig`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    /// Records per window
    pub seq_length: usize,
    pub batch_size: usize,
    pub local_epochs: usize,
    /// Share of windows held out for evaluation
    pub test_fraction: f64,
    /// Seed for the train/test split
    pub split_seed: u64,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            seq_length: 20,
            batch_size: 32,
            local_epochs: 1,
            test_fraction: 0.2,
            split_seed: 42,
        }
    }
}

/// [`Participant`] backed by a [`LocalModel`] and a local dataset.
pub struct DroneParticipant<M: LocalModel> {
    id: String,
    model: Mutex<M>,
    train: Arc<SequenceDataset>,
    test: Arc<SequenceDataset>,
    config: LearnerConfig,
}

impl<M: LocalModel> DroneParticipant<M> {
    /// Window `records` and split them into train and test halves.
    pub fn new(
        id: &str,
        model: M,
        records: Vec<SensorRecord>,
        config: LearnerConfig,
    ) -> Result<Self> {
        let dataset = SequenceDataset::from_records(records, config.seq_length)?;
        let (train, test) = dataset.stratified_split(config.test_fraction, config.split_seed)?;
        debug!(
            participant = id,
            train = train.len(),
            test = test.len(),
            "local dataset prepared"
        );
        Ok(Self::from_split(id, model, train, test, config))
    }

    /// Use an existing split.
    pub fn from_split(
        id: &str,
        model: M,
        train: SequenceDataset,
        test: SequenceDataset,
        config: LearnerConfig,
    ) -> Self {
        Self {
            id: id.to_string(),
            model: Mutex::new(model),
            train: Arc::new(train),
            test: Arc::new(test),
            config,
        }
    }

    pub fn train_len(&self) -> usize {
        self.train.len()
    }

    pub fn test_len(&self) -> usize {
        self.test.len()
    }

    /// Current local weights.
    pub async fn local_parameters(&self) -> ParameterVector {
        self.model.lock().await.parameters()
    }

    /// Copy of the local model loaded with `parameters`.
    async fn loaded(&self, parameters: &ParameterVector) -> ParticipantResult<M> {
        let mut model = self.model.lock().await.clone();
        model
            .set_parameters(parameters)
            .map_err(|e| ParticipantError::InvalidParameters(e.to_string()))?;
        Ok(model)
    }
}

#[async_trait]
impl<M: LocalModel> Participant for DroneParticipant<M> {
    fn id(&self) -> &str {
        &self.id
    }

    async fn fit(
        &self,
        parameters: ParameterVector,
        config: TrainingConfig,
    ) -> ParticipantResult<Update> {
        let epochs = config.local_epochs().unwrap_or(self.config.local_epochs);
        let batch_size = config.batch_size().unwrap_or(self.config.batch_size);
        let mut model = self.loaded(&parameters).await?;
        let train = Arc::clone(&self.train);

        let (model, result) = tokio::task::spawn_blocking(move || {
            let result = model.train(&train, epochs, batch_size)?;
            Ok::<_, crate::core::Error>((model, result))
        })
        .await
        .map_err(|e| ParticipantError::Training(e.to_string()))?
        .map_err(|e| ParticipantError::Training(e.to_string()))?;

        debug!(
            participant = %self.id,
            round = config.round_index(),
            loss = result.loss,
            "local training finished"
        );

        let updated = model.parameters();
        *self.model.lock().await = model;

        let mut metrics = MetricMap::new();
        metrics.insert("loss".to_string(), result.loss);
        Ok(Update::new(updated, self.train.len() as u64, metrics))
    }

    async fn evaluate(
        &self,
        parameters: ParameterVector,
        _config: TrainingConfig,
    ) -> ParticipantResult<EvaluationResult> {
        let model = self.loaded(&parameters).await?;
        let test = Arc::clone(&self.test);

        let evaluation = tokio::task::spawn_blocking(move || model.evaluate(&test))
            .await
            .map_err(|e| ParticipantError::Evaluation(e.to_string()))?
            .map_err(|e| ParticipantError::Evaluation(e.to_string()))?;

        let mut metrics = MetricMap::new();
        metrics.insert("accuracy".to_string(), evaluation.accuracy);
        Ok(EvaluationResult::new(
            evaluation.loss,
            self.test.len() as u64,
            metrics,
        ))
    }
}
