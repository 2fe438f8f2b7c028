//! Session, strategy and per-round training configuration.

use crate::core::{Error, Result};
use crate::federated::checkpoint::CheckpointPolicy;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Key carrying the round index in every [`TrainingConfig`].
pub const ROUND_INDEX_KEY: &str = "round_index";
/// Key carrying the local epoch count in fit configs.
pub const LOCAL_EPOCHS_KEY: &str = "local_epochs";
/// Key carrying the local batch size in fit configs.
pub const BATCH_SIZE_KEY: &str = "batch_size";

/// A typed configuration value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    /// Unsigned values beyond `i64::MAX`
    UInt(u64),
    Float(f64),
    Text(String),
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for ConfigValue {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(v) => Self::Int(v),
            Err(_) => Self::UInt(v),
        }
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// Immutable key-value configuration handed to participants each round.
///
/// Built by the coordinator at round start; participants only read it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    values: BTreeMap<String, ConfigValue>,
}

impl TrainingConfig {
    /// Create a config carrying only the round index.
    pub fn new(round_index: u64) -> Self {
        Self::default().with(ROUND_INDEX_KEY, round_index)
    }

    /// Add a value. Consumes the config so nothing can change it once sent.
    pub fn with(mut self, key: &str, value: impl Into<ConfigValue>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    /// Config sent with a fit request.
    pub(crate) fn for_fit(round_index: u64, strategy: &StrategyConfig) -> Self {
        let mut config = Self::new(round_index)
            .with(LOCAL_EPOCHS_KEY, strategy.local_epochs as u64)
            .with(BATCH_SIZE_KEY, strategy.batch_size as u64);
        for (key, value) in &strategy.extra_config {
            config.values.entry(key.clone()).or_insert_with(|| value.clone());
        }
        config
    }

    /// Config sent with an evaluate request.
    pub(crate) fn for_evaluate(round_index: u64, strategy: &StrategyConfig) -> Self {
        let mut config = Self::new(round_index);
        for (key, value) in &strategy.extra_config {
            config.values.entry(key.clone()).or_insert_with(|| value.clone());
        }
        config
    }

    /// Get a raw value.
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.values.get(key)
    }

    /// Get an integer value.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.values.get(key) {
            Some(ConfigValue::Int(v)) => Some(*v),
            _ => None,
        }
    }

    /// Get a non-negative integer value.
    pub fn get_uint(&self, key: &str) -> Option<u64> {
        match self.values.get(key) {
            Some(ConfigValue::Int(v)) => u64::try_from(*v).ok(),
            Some(ConfigValue::UInt(v)) => Some(*v),
            _ => None,
        }
    }

    /// Get a float value; integers are widened.
    pub fn get_float(&self, key: &str) -> Option<f64> {
        match self.values.get(key) {
            Some(ConfigValue::Float(v)) => Some(*v),
            Some(ConfigValue::Int(v)) => Some(*v as f64),
            Some(ConfigValue::UInt(v)) => Some(*v as f64),
            _ => None,
        }
    }

    /// Round this config was issued for.
    pub fn round_index(&self) -> u64 {
        self.get_uint(ROUND_INDEX_KEY).unwrap_or(0)
    }

    pub fn local_epochs(&self) -> Option<usize> {
        self.get_uint(LOCAL_EPOCHS_KEY)
            .and_then(|v| usize::try_from(v).ok())
    }

    pub fn batch_size(&self) -> Option<usize> {
        self.get_uint(BATCH_SIZE_KEY).and_then(|v| usize::try_from(v).ok())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Participation, quorum and timeout policy for every round.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Fraction of registered participants asked to fit
    pub fraction_fit: f64,
    /// Fraction of registered participants asked to evaluate (0 disables)
    pub fraction_evaluate: f64,
    /// Minimum fit participants, both to select and to commit
    pub min_fit_clients: usize,
    /// Minimum successful evaluations to report a loss
    pub min_evaluate_clients: usize,
    /// Minimum registry size to attempt a round at all
    pub min_available_clients: usize,
    /// Per-phase collection timeout in milliseconds
    pub round_timeout_ms: u64,
    /// Local epochs requested from participants
    pub local_epochs: usize,
    /// Local batch size requested from participants
    pub batch_size: usize,
    /// Seed for participant sampling (None = entropy)
    pub sampling_seed: Option<u64>,
    /// Metric names kept after aggregation (empty = keep all)
    pub recognized_metrics: BTreeSet<String>,
    /// Additional entries copied into every TrainingConfig
    pub extra_config: BTreeMap<String, ConfigValue>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            fraction_fit: 1.0,
            fraction_evaluate: 1.0,
            min_fit_clients: 2,
            min_evaluate_clients: 2,
            min_available_clients: 2,
            round_timeout_ms: 300_000,
            local_epochs: 1,
            batch_size: 32,
            sampling_seed: None,
            recognized_metrics: ["accuracy".to_string()].into_iter().collect(),
            extra_config: BTreeMap::new(),
        }
    }
}

impl StrategyConfig {
    /// Set the fit fraction and minimum.
    pub fn with_fit(mut self, fraction: f64, min_clients: usize) -> Self {
        self.fraction_fit = fraction;
        self.min_fit_clients = min_clients;
        self
    }

    /// Set the evaluate fraction and minimum.
    pub fn with_evaluate(mut self, fraction: f64, min_clients: usize) -> Self {
        self.fraction_evaluate = fraction;
        self.min_evaluate_clients = min_clients;
        self
    }

    /// Set the minimum registry size.
    pub fn with_min_available(mut self, min_clients: usize) -> Self {
        self.min_available_clients = min_clients;
        self
    }

    /// Set the per-phase timeout, rounded up to whole milliseconds.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.round_timeout_ms = millis_ceil(timeout);
        self
    }

    /// Seed participant sampling.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.sampling_seed = Some(seed);
        self
    }

    /// Replace the recognized metric names.
    pub fn with_metrics<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recognized_metrics = names.into_iter().map(Into::into).collect();
        self
    }

    /// Per-phase collection timeout.
    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    /// Number of participants to ask to fit out of `available`.
    pub fn fit_sample_size(&self, available: usize) -> usize {
        sample_size(self.fraction_fit, self.min_fit_clients, available)
    }

    /// Number of participants to ask to evaluate out of `available`.
    pub fn evaluate_sample_size(&self, available: usize) -> usize {
        sample_size(self.fraction_evaluate, self.min_evaluate_clients, available)
    }

    /// Whether the evaluation sub-phase runs at all.
    pub fn evaluation_enabled(&self) -> bool {
        self.fraction_evaluate > 0.0
    }

    /// Check the policy is usable.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("fraction_fit", self.fraction_fit),
            ("fraction_evaluate", self.fraction_evaluate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::InvalidConfig(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.fraction_fit == 0.0 {
            return Err(Error::InvalidConfig("fraction_fit must be positive".into()));
        }
        if self.min_fit_clients == 0 {
            return Err(Error::InvalidConfig("min_fit_clients must be at least 1".into()));
        }
        if self.evaluation_enabled() && self.min_evaluate_clients == 0 {
            return Err(Error::InvalidConfig(
                "min_evaluate_clients must be at least 1 when evaluation is enabled".into(),
            ));
        }
        if self.min_available_clients < self.min_fit_clients {
            return Err(Error::InvalidConfig(format!(
                "min_available_clients ({}) is below min_fit_clients ({})",
                self.min_available_clients, self.min_fit_clients
            )));
        }
        if self.round_timeout_ms == 0 {
            return Err(Error::InvalidConfig("round_timeout_ms must be positive".into()));
        }
        if self.local_epochs == 0 || self.batch_size == 0 {
            return Err(Error::InvalidConfig(
                "local_epochs and batch_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

fn millis_ceil(duration: Duration) -> u64 {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if duration.subsec_nanos() % 1_000_000 == 0 {
        millis
    } else {
        millis.saturating_add(1)
    }
}

/// ceil(fraction * available), raised to `minimum`, capped at `available`.
fn sample_size(fraction: f64, minimum: usize, available: usize) -> usize {
    let wanted = (fraction * available as f64).ceil() as usize;
    wanted.max(minimum).min(available)
}

/// Top-level configuration of a training session.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Rounds to run
    pub num_rounds: u64,
    /// Participation policy
    pub strategy: StrategyConfig,
    /// When checkpoints are written
    pub checkpoint_policy: CheckpointPolicy,
    /// Directory for file checkpoints
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            num_rounds: 5,
            strategy: StrategyConfig::default(),
            checkpoint_policy: CheckpointPolicy::default(),
            checkpoint_dir: None,
        }
    }
}

impl SessionConfig {
    /// Set the number of rounds.
    pub fn with_rounds(mut self, num_rounds: u64) -> Self {
        self.num_rounds = num_rounds;
        self
    }

    /// Set the strategy.
    pub fn with_strategy(mut self, strategy: StrategyConfig) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the checkpoint policy and directory.
    pub fn with_checkpoints(mut self, policy: CheckpointPolicy, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_policy = policy;
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Parse from JSON; missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        self.strategy.validate()
    }
}
