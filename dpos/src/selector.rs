//! Lucky-wheel weighted random selection.
//!
//! Given weighted entries and a seed, select `target` distinct entries with
//! probability proportional to weight. Selection is without replacement, so
//! no address appears twice in the result, and fully deterministic for a
//! given seed, so every node replaying the same seed agrees on the outcome.

use alloy_primitives::{Address, U256};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

/// One wheel entry: an address and its vote weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectorEntry {
    pub addr: Address,
    pub vote: U256,
}

impl SelectorEntry {
    pub fn new(addr: Address, vote: impl Into<U256>) -> Self {
        Self {
            addr,
            vote: vote.into(),
        }
    }
}

/// Spin the lucky wheel: pick `target` entries weighted by vote.
///
/// When there are fewer entries than the target, all entries are returned in
/// a seeded shuffle instead.
pub fn lucky_wheel(entries: &[SelectorEntry], seed: u64, target: usize) -> Vec<Address> {
    let mut rng = StdRng::seed_from_u64(seed);

    if entries.len() < target {
        let mut all: Vec<Address> = entries.iter().map(|e| e.addr).collect();
        all.shuffle(&mut rng);
        return all;
    }

    let mut pool: Vec<SelectorEntry> = entries.to_vec();
    let mut sum: U256 = pool.iter().map(|e| e.vote).sum();
    let mut results = Vec::with_capacity(target);

    for _ in 0..target {
        let index = select_single_entry(&mut rng, &pool, sum);
        let selected = pool.swap_remove(index);
        sum -= selected.vote;
        results.push(selected.addr);
    }
    results
}

/// Pick one index from the pool, weighted by vote.
fn select_single_entry(rng: &mut StdRng, pool: &[SelectorEntry], sum: U256) -> usize {
    if sum.is_zero() {
        // All weights zero: fall back to uniform choice
        return rng.random_range(0..pool.len());
    }
    let mut pick = random_below(rng, sum);
    for (i, entry) in pool.iter().enumerate() {
        if pick < entry.vote {
            return i;
        }
        pick -= entry.vote;
    }
    // Unreachable when sum equals the pool total
    pool.len() - 1
}

/// A uniform-enough random value in `[0, max)`.
fn random_below(rng: &mut StdRng, max: U256) -> U256 {
    let raw: [u8; 32] = rng.random();
    U256::from_be_bytes(raw) % max
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn entries(weights: &[(u8, u64)]) -> Vec<SelectorEntry> {
        weights
            .iter()
            .map(|(b, w)| SelectorEntry::new(Address::repeat_byte(*b), U256::from(*w)))
            .collect()
    }

    #[test]
    fn selection_is_deterministic_for_a_seed() {
        let wheel = entries(&[(1, 100), (2, 100), (3, 100)]);
        let first = lucky_wheel(&wheel, 42, 2);
        let second = lucky_wheel(&wheel, 42, 2);
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn selection_is_permutation_free() {
        let wheel = entries(&[(1, 100), (2, 100), (3, 100)]);
        for seed in 0..64 {
            let picked = lucky_wheel(&wheel, seed, 2);
            let unique: HashSet<_> = picked.iter().collect();
            assert_eq!(unique.len(), picked.len(), "duplicate pick at seed {seed}");
        }
    }

    #[test]
    fn different_seeds_can_differ() {
        let wheel = entries(&[(1, 100), (2, 100), (3, 100)]);
        let outcomes: HashSet<Vec<Address>> =
            (0..32).map(|seed| lucky_wheel(&wheel, seed, 2)).collect();
        assert!(outcomes.len() > 1);
    }

    #[test]
    fn fewer_entries_than_target_returns_all_shuffled() {
        let wheel = entries(&[(1, 5), (2, 10)]);
        let picked = lucky_wheel(&wheel, 7, 5);
        assert_eq!(picked.len(), 2);
        let unique: HashSet<_> = picked.iter().collect();
        assert_eq!(unique.len(), 2);
    }

    #[test]
    fn heavy_weight_dominates() {
        let wheel = entries(&[(1, 1_000_000), (2, 1), (3, 1)]);
        let mut first_picks = HashSet::new();
        for seed in 0..32 {
            first_picks.insert(lucky_wheel(&wheel, seed, 1)[0]);
        }
        // The overwhelming weight should win essentially always
        assert!(first_picks.contains(&Address::repeat_byte(1)));
        assert!(first_picks.len() <= 2);
    }

    #[test]
    fn zero_weights_still_select() {
        let wheel = entries(&[(1, 0), (2, 0), (3, 0)]);
        let picked = lucky_wheel(&wheel, 3, 2);
        assert_eq!(picked.len(), 2);
    }
}
