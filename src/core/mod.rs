//! Core utilities and common types for dronefed.

pub mod error;
pub mod types;

pub use error::{Error, Phase, Result};
pub use types::*;
