//! Participant sampling for each phase of a round.

use crate::core::Phase;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Picks which participants take part in a phase.
///
/// Draws uniformly without replacement. With a seed, the draw depends only
/// on the seed, round index and phase, so runs are reproducible.
#[derive(Clone, Debug, Default)]
pub struct ClientSampler {
    seed: Option<u64>,
}

impl ClientSampler {
    /// Create a sampler; `None` draws from OS entropy.
    pub fn new(seed: Option<u64>) -> Self {
        Self { seed }
    }

    /// Select `count` candidates, keeping their original relative order.
    pub fn select<T: Clone>(
        &self,
        candidates: &[T],
        count: usize,
        round_index: u64,
        phase: Phase,
    ) -> Vec<T> {
        if count >= candidates.len() {
            return candidates.to_vec();
        }

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(round_seed(seed, round_index, phase)),
            None => StdRng::from_entropy(),
        };

        let mut indices = rand::seq::index::sample(&mut rng, candidates.len(), count).into_vec();
        indices.sort_unstable();
        indices.into_iter().map(|i| candidates[i].clone()).collect()
    }
}

fn round_seed(seed: u64, round_index: u64, phase: Phase) -> u64 {
    let phase_bit = match phase {
        Phase::Fit => 0,
        Phase::Evaluate => 1,
    };
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ round_index.rotate_left(17)
        ^ phase_bit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selects_everyone_when_count_covers_all() {
        let sampler = ClientSampler::new(None);
        let picked = sampler.select(&["a", "b", "c"], 5, 0, Phase::Fit);
        assert_eq!(picked, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_selects_exact_count_without_duplicates() {
        let sampler = ClientSampler::new(None);
        let candidates: Vec<u32> = (0..20).collect();
        let picked = sampler.select(&candidates, 7, 3, Phase::Fit);
        assert_eq!(picked.len(), 7);
        let mut deduped = picked.clone();
        deduped.dedup();
        assert_eq!(deduped.len(), 7);
        assert!(picked.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_seeded_selection_is_reproducible() {
        let candidates: Vec<u32> = (0..50).collect();
        let a = ClientSampler::new(Some(42)).select(&candidates, 10, 2, Phase::Fit);
        let b = ClientSampler::new(Some(42)).select(&candidates, 10, 2, Phase::Fit);
        assert_eq!(a, b);
    }
}
