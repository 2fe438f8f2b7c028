//! The authoritative global model.

use crate::core::{now, Hash256, Result, Timestamp};
use crate::federated::tensor::ParameterVector;
use serde::{Deserialize, Serialize};

/// Current global parameters plus the round that produced them.
///
/// Owned by the training session. Only the round coordinator commits to it,
/// once per successfully aggregated round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlobalModelState {
    parameters: ParameterVector,
    version: u64,
    last_committed_round: Option<u64>,
    committed_at: Option<Timestamp>,
}

impl GlobalModelState {
    /// Start from initial parameters at version 0.
    pub fn new(initial: ParameterVector) -> Self {
        Self {
            parameters: initial,
            version: 0,
            last_committed_round: None,
            committed_at: None,
        }
    }

    pub fn parameters(&self) -> &ParameterVector {
        &self.parameters
    }

    /// Copy of the parameters, as handed to participants.
    pub fn snapshot(&self) -> ParameterVector {
        self.parameters.clone()
    }

    /// Number of commits since initialisation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Round index of the most recent commit.
    pub fn last_committed_round(&self) -> Option<u64> {
        self.last_committed_round
    }

    /// Wall-clock time of the most recent commit.
    pub fn committed_at(&self) -> Option<Timestamp> {
        self.committed_at
    }

    pub fn fingerprint(&self) -> Hash256 {
        self.parameters.fingerprint()
    }

    /// Adopt aggregated parameters. Shapes must match the current ones.
    pub(crate) fn commit(&mut self, parameters: ParameterVector, round_index: u64) -> Result<()> {
        self.parameters.check_shapes(&parameters)?;
        self.parameters = parameters;
        self.version += 1;
        self.last_committed_round = Some(round_index);
        self.committed_at = Some(now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state() {
        let state = GlobalModelState::new(ParameterVector::from_scalars(&[0.0, 1.0]));
        assert_eq!(state.version(), 0);
        assert_eq!(state.last_committed_round(), None);
        assert!(state.committed_at().is_none());
    }

    #[test]
    fn test_commit_advances_version() {
        let mut state = GlobalModelState::new(ParameterVector::from_scalars(&[0.0]));
        state.commit(ParameterVector::from_scalars(&[1.0]), 3).unwrap();
        assert_eq!(state.version(), 1);
        assert_eq!(state.last_committed_round(), Some(3));
        assert_eq!(state.parameters().tensors()[0][[0]], 1.0);
    }

    #[test]
    fn test_commit_rejects_shape_change() {
        let mut state = GlobalModelState::new(ParameterVector::from_scalars(&[0.0]));
        let before = state.clone();
        assert!(state.commit(ParameterVector::from_scalars(&[1.0, 2.0]), 0).is_err());
        assert_eq!(state, before);
    }
}
