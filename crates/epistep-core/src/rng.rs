//! Deterministic PRNG for process and listener logic.
//!
//! Uses the SplitMix64 algorithm: fast, 8 bytes of state, and trivially
//! serializable for snapshots. A simulation seeded with the same value and
//! driven by the same processes reproduces the same run exactly.

use crate::fixed::Fixed64;
use crate::id::PersonId;

/// SplitMix64 pseudo-random number generator.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SimRng {
    state: u64,
}

impl SimRng {
    /// Create a new RNG with the given seed.
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate the next `u64` in the sequence.
    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform integer in `0..bound`. Returns 0 when `bound` is 0.
    pub fn next_below(&mut self, bound: u64) -> u64 {
        if bound == 0 {
            return 0;
        }
        ((self.next_u64() as u128 * bound as u128) >> 64) as u64
    }

    /// Returns `true` with the given probability (Fixed64 in [0, 1]).
    ///
    /// - probability <= 0 always returns false
    /// - probability >= 1 always returns true
    pub fn chance(&mut self, probability: Fixed64) -> bool {
        if probability <= Fixed64::ZERO {
            return false;
        }
        if probability >= Fixed64::from_num(1) {
            return true;
        }
        // For p in (0,1) the raw Q32.32 bits are the fraction scaled to [0, 2^32).
        let upper = (self.next_u64() >> 32) as u32;
        (upper as u64) < probability.to_bits() as u64
    }

    /// Draw up to `k` distinct persons from `persons` without replacement.
    ///
    /// Partial Fisher-Yates over a copy; the input slice is left untouched.
    pub fn sample(&mut self, persons: &[PersonId], k: usize) -> Vec<PersonId> {
        let mut pool = persons.to_vec();
        let k = k.min(pool.len());
        for i in 0..k {
            let j = i + self.next_below((pool.len() - i) as u64) as usize;
            pool.swap(i, j);
        }
        pool.truncate(k);
        pool
    }

    /// Keep each person independently with the given probability.
    pub fn filter(&mut self, persons: &[PersonId], probability: Fixed64) -> Vec<PersonId> {
        persons
            .iter()
            .copied()
            .filter(|_| self.chance(probability))
            .collect()
    }

    /// Get the internal state (for hashing/serialization).
    pub fn state(&self) -> u64 {
        self.state
    }
}
