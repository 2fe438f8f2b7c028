//! Registry of currently reachable participants.

use crate::federated::participant::Participant;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Shared handle to a participant.
pub type ParticipantHandle = Arc<dyn Participant>;

/// Set of participants that may be asked to take part in a round.
///
/// Cloning yields another handle to the same registry, so participants can
/// join or leave while a session runs. Rounds work on a [`snapshot`].
///
/// [`snapshot`]: ParticipantRegistry::snapshot
#[derive(Clone, Default)]
pub struct ParticipantRegistry {
    participants: Arc<RwLock<BTreeMap<String, ParticipantHandle>>>,
}

impl ParticipantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant, replacing any previous one with the same id.
    /// Returns true if the id was new.
    pub async fn join(&self, participant: ParticipantHandle) -> bool {
        let id = participant.id().to_string();
        let previous = self
            .participants
            .write()
            .await
            .insert(id.clone(), participant);
        if previous.is_none() {
            info!(participant = %id, "participant joined");
        } else {
            debug!(participant = %id, "participant re-registered");
        }
        previous.is_none()
    }

    /// Remove a participant. Returns true if it was registered.
    pub async fn leave(&self, id: &str) -> bool {
        let removed = self.participants.write().await.remove(id).is_some();
        if removed {
            info!(participant = %id, "participant left");
        }
        removed
    }

    /// Number of registered participants.
    pub async fn len(&self) -> usize {
        self.participants.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.participants.read().await.is_empty()
    }

    /// Whether `id` is registered.
    pub async fn contains(&self, id: &str) -> bool {
        self.participants.read().await.contains_key(id)
    }

    /// Registered ids in order.
    pub async fn ids(&self) -> Vec<String> {
        self.participants.read().await.keys().cloned().collect()
    }

    /// Point-in-time copy of the registered handles, ordered by id.
    pub async fn snapshot(&self) -> Vec<ParticipantHandle> {
        self.participants.read().await.values().cloned().collect()
    }
}

impl std::fmt::Debug for ParticipantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticipantRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federated::config::TrainingConfig;
    use crate::federated::participant::{EvaluationResult, ParticipantResult, Update};
    use crate::federated::tensor::ParameterVector;
    use async_trait::async_trait;

    struct Named(&'static str);

    #[async_trait]
    impl Participant for Named {
        fn id(&self) -> &str {
            self.0
        }

        async fn fit(
            &self,
            parameters: ParameterVector,
            _config: TrainingConfig,
        ) -> ParticipantResult<Update> {
            Ok(Update::new(parameters, 1, Default::default()))
        }

        async fn evaluate(
            &self,
            _parameters: ParameterVector,
            _config: TrainingConfig,
        ) -> ParticipantResult<EvaluationResult> {
            Ok(EvaluationResult::new(0.0, 1, Default::default()))
        }
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let registry = ParticipantRegistry::new();
        assert!(registry.join(Arc::new(Named("drone2"))).await);
        assert!(registry.join(Arc::new(Named("drone1"))).await);
        assert!(!registry.join(Arc::new(Named("drone1"))).await);
        assert_eq!(registry.len().await, 2);

        assert!(registry.leave("drone2").await);
        assert!(!registry.leave("drone2").await);
        assert!(!registry.contains("drone2").await);
    }

    #[tokio::test]
    async fn test_snapshot_is_ordered_and_detached() {
        let registry = ParticipantRegistry::new();
        registry.join(Arc::new(Named("drone3"))).await;
        registry.join(Arc::new(Named("drone1"))).await;

        let snapshot = registry.snapshot().await;
        registry.leave("drone1").await;

        let ids: Vec<&str> = snapshot.iter().map(|p| p.id()).collect();
        assert_eq!(ids, vec!["drone1", "drone3"]);
        assert_eq!(registry.ids().await, vec!["drone3".to_string()]);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let registry = ParticipantRegistry::new();
        let other = registry.clone();
        other.join(Arc::new(Named("drone1"))).await;
        assert!(!registry.is_empty().await);
    }
}
