//! Node selection among eligible candidates.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::admission::EligibilitySet;
use crate::config::{AdmissionConfig, SelectionStrategy};
use crate::types::NodeId;

/// Chooses one node from an eligibility set.
pub trait SelectionPolicy: Send + Sync + fmt::Debug {
    /// Picks a node, or `None` if the set is empty.
    fn select(&self, eligible: &EligibilitySet) -> Option<NodeId>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

fn rng_from(seed: Option<u64>) -> StdRng {
    seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64)
}

/// Uniform random choice.
#[derive(Debug)]
pub struct UniformRandom {
    rng: Mutex<StdRng>,
}

impl UniformRandom {
    /// Seeded from system entropy.
    #[must_use]
    pub fn new() -> Self {
        Self::with_rng(rng_from(None))
    }

    /// Deterministic sequence for a given seed.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    /// Uses the supplied random source.
    #[must_use]
    pub fn with_rng(rng: StdRng) -> Self {
        Self { rng: Mutex::new(rng) }
    }
}

impl Default for UniformRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionPolicy for UniformRandom {
    fn select(&self, eligible: &EligibilitySet) -> Option<NodeId> {
        let candidates = eligible.candidates();
        if candidates.is_empty() {
            return None;
        }
        let index = self.rng.lock().gen_range(0..candidates.len());
        Some(candidates[index].node.clone())
    }

    fn name(&self) -> &'static str {
        "uniform_random"
    }
}

/// Rotates through eligible nodes in id order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicU64,
}

impl RoundRobin {
    /// Starts at the first eligible node.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionPolicy for RoundRobin {
    #[allow(clippy::cast_possible_truncation)]
    fn select(&self, eligible: &EligibilitySet) -> Option<NodeId> {
        let candidates = eligible.candidates();
        if candidates.is_empty() {
            return None;
        }
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let index = (counter as usize) % candidates.len();
        Some(candidates[index].node.clone())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Resolution of headroom weights.
const WEIGHT_SCALE: f64 = 1_000_000.0;

/// Random choice weighted by remaining headroom.
///
/// A node's weight is the smaller of its remaining RPM and BPM fractions,
/// so emptier nodes are picked more often.
#[derive(Debug)]
pub struct WeightedHeadroom {
    rng: Mutex<StdRng>,
}

impl WeightedHeadroom {
    /// Seeded from system entropy.
    #[must_use]
    pub fn new() -> Self {
        Self::with_rng(rng_from(None))
    }

    /// Deterministic sequence for a given seed.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    /// Uses the supplied random source.
    #[must_use]
    pub fn with_rng(rng: StdRng) -> Self {
        Self { rng: Mutex::new(rng) }
    }
}

impl Default for WeightedHeadroom {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionPolicy for WeightedHeadroom {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn select(&self, eligible: &EligibilitySet) -> Option<NodeId> {
        let candidates = eligible.candidates();
        let last = candidates.last()?;

        // Every candidate gets at least weight 1 so a nearly full node stays reachable.
        let weights: Vec<u64> = candidates
            .iter()
            .map(|c| ((c.headroom_fraction() * WEIGHT_SCALE) as u64).max(1))
            .collect();
        let total: u64 = weights.iter().sum();

        let random_value = self.rng.lock().gen_range(0..total);
        let mut cumulative = 0u64;
        for (candidate, weight) in candidates.iter().zip(&weights) {
            cumulative += weight;
            if random_value < cumulative {
                return Some(candidate.node.clone());
            }
        }
        Some(last.node.clone())
    }

    fn name(&self) -> &'static str {
        "weighted_headroom"
    }
}

/// Builds the configured policy.
#[must_use]
pub fn policy_from_config(config: &AdmissionConfig) -> Box<dyn SelectionPolicy> {
    match config.selection {
        SelectionStrategy::UniformRandom => Box::new(UniformRandom::with_rng(rng_from(config.seed))),
        SelectionStrategy::RoundRobin => Box::new(RoundRobin::new()),
        SelectionStrategy::WeightedHeadroom => Box::new(WeightedHeadroom::with_rng(rng_from(config.seed))),
    }
}
