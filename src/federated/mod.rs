//! Federated Training Module
//!
//! Coordinates rounds of federated training across remote participants:
//! - Participant registry and sampling
//! - Concurrent fit/evaluate collection with deadlines and quorum
//! - Sample-weighted aggregation of parameters and metrics
//! - Multi-round sessions with checkpointing

pub mod aggregator;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod participant;
pub mod registry;
pub mod selection;
pub mod session;
pub mod state;
pub mod summary;
pub mod tensor;

pub use aggregator::{
    aggregate_evaluations, aggregate_fit_metrics, aggregate_parameters, Aggregation,
    EvaluationAggregate,
};
pub use checkpoint::{
    read_checkpoint, Checkpoint, CheckpointPolicy, CheckpointWriter, FileCheckpointWriter,
};
pub use config::{ConfigValue, SessionConfig, StrategyConfig, TrainingConfig};
pub use coordinator::RoundCoordinator;
pub use participant::{
    EvaluationResult, MetricMap, Participant, ParticipantError, ParticipantResult, Update,
};
pub use registry::{ParticipantHandle, ParticipantRegistry};
pub use selection::ClientSampler;
pub use session::{SessionReport, TrainingSession};
pub use state::GlobalModelState;
pub use summary::{
    EvaluationStatus, FailureKind, ParticipantFailure, RoundError, RoundStatus, RoundSummary,
};
pub use tensor::ParameterVector;
