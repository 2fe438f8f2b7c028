//! # dronefed - Federated training coordination for drone fleets
//!
//! Trains one shared model across drones that keep their telemetry local:
//! - **federated**: round coordination, quorum, weighted aggregation, sessions
//! - **local**: the drone side (windowed datasets, local models, participant)
//! - **monitoring**: tracing setup and Prometheus round metrics
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dronefed::federated::{ParticipantRegistry, SessionConfig, TrainingSession};
//! use dronefed::local::{
//!     CsvColumns, DroneParticipant, LearnerConfig, LocalModel, SensorRecord, SequenceClassifier,
//! };
//! use dronefed::monitoring::{init_tracing, LoggerConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> dronefed::Result<()> {
//!     init_tracing(&LoggerConfig::default())?;
//!
//!     let registry = ParticipantRegistry::new();
//!     for id in ["drone1", "drone2", "drone3"] {
//!         let path = format!("drones_data/{}/merged_labeled_file.csv", id);
//!         let records = SensorRecord::read_csv(&path, &CsvColumns::default())?;
//!         let drone = DroneParticipant::new(
//!             id,
//!             SequenceClassifier::new(20, 7),
//!             records,
//!             LearnerConfig::default(),
//!         )?;
//!         registry.join(Arc::new(drone)).await;
//!     }
//!
//!     let initial = SequenceClassifier::new(20, 7).parameters();
//!     let session = TrainingSession::new(SessionConfig::default(), registry, initial)?;
//!     let report = session.run_configured().await;
//!     println!("{}", report.to_json()?);
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod federated;
pub mod local;
pub mod monitoring;

pub use core::error::{Error, Result};
