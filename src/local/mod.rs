//! Local Training Module
//!
//! The data-holder side of federated training:
//! - Telemetry CSV ingestion
//! - Sensor records to standardized, windowed datasets
//! - Trainable local models
//! - A [`Participant`](crate::federated::Participant) built from both

pub mod dataset;
pub mod learner;
pub mod model;

pub use dataset::{CsvColumns, SensorRecord, SequenceDataset, StandardScaler};
pub use learner::{DroneParticipant, LearnerConfig};
pub use model::{LocalModel, ModelEvaluation, SequenceClassifier, TrainingResult};
