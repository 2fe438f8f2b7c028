//! Checkpointing of the global model after each round.

use crate::core::{now, Error, Hash256, Result, Timestamp};
use crate::federated::state::GlobalModelState;
use crate::federated::summary::RoundSummary;
use crate::federated::tensor::ParameterVector;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which rounds get a checkpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointPolicy {
    /// No checkpoints
    Never,
    /// Only rounds that committed new parameters
    #[default]
    CommittedOnly,
    /// Every round; failed rounds store the unchanged model
    EveryRound,
}

impl CheckpointPolicy {
    pub fn should_write(&self, summary: &RoundSummary) -> bool {
        match self {
            CheckpointPolicy::Never => false,
            CheckpointPolicy::CommittedOnly => summary.is_committed(),
            CheckpointPolicy::EveryRound => true,
        }
    }
}

/// Global model as of the end of one round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub round_index: u64,
    pub model_version: u64,
    /// Whether the round committed new parameters
    pub committed: bool,
    pub fingerprint: Hash256,
    pub parameters: ParameterVector,
    pub written_at: Timestamp,
}

impl Checkpoint {
    /// Capture the state after `summary`'s round.
    pub fn capture(summary: &RoundSummary, state: &GlobalModelState) -> Self {
        Self {
            round_index: summary.round_index,
            model_version: state.version(),
            committed: summary.is_committed(),
            fingerprint: state.fingerprint(),
            parameters: state.snapshot(),
            written_at: now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode and check the stored fingerprint.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let checkpoint: Checkpoint = bincode::deserialize(bytes)?;
        if checkpoint.parameters.fingerprint() != checkpoint.fingerprint {
            return Err(Error::Checkpoint(format!(
                "fingerprint mismatch for round {}",
                checkpoint.round_index
            )));
        }
        Ok(checkpoint)
    }
}

/// Destination for checkpoints.
#[async_trait]
pub trait CheckpointWriter: Send + Sync {
    /// Persist a checkpoint, returning where it went.
    async fn write(&self, checkpoint: &Checkpoint) -> Result<String>;
}

/// Writes `model_round{r}_{YYYYmmdd_HHMMSS}.bin` files into a directory.
#[derive(Clone, Debug)]
pub struct FileCheckpointWriter {
    dir: PathBuf,
}

impl FileCheckpointWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File name for a checkpoint.
    pub fn file_name(checkpoint: &Checkpoint) -> String {
        format!(
            "model_round{}_{}.bin",
            checkpoint.round_index,
            checkpoint.written_at.format("%Y%m%d_%H%M%S")
        )
    }
}

#[async_trait]
impl CheckpointWriter for FileCheckpointWriter {
    async fn write(&self, checkpoint: &Checkpoint) -> Result<String> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(Self::file_name(checkpoint));
        tokio::fs::write(&path, checkpoint.to_bytes()?).await?;
        Ok(path.display().to_string())
    }
}

/// Load a checkpoint written by [`FileCheckpointWriter`].
pub async fn read_checkpoint(path: impl AsRef<Path>) -> Result<Checkpoint> {
    let bytes = tokio::fs::read(path).await?;
    Checkpoint::from_bytes(&bytes)
}
