//! Lucky-wheel selector properties.

use std::collections::HashSet;

use alloy_primitives::{Address, U256};
use proptest::prelude::*;

use dpos::selector::{lucky_wheel, SelectorEntry};

fn entries(weights: &[u64]) -> Vec<SelectorEntry> {
    weights
        .iter()
        .enumerate()
        .map(|(i, w)| SelectorEntry::new(Address::repeat_byte(i as u8 + 1), U256::from(*w)))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// One seed, one outcome.
    #[test]
    fn selection_is_deterministic(
        weights in prop::collection::vec(0u64..1_000_000, 1..32),
        seed in any::<u64>(),
        target in 0usize..40,
    ) {
        let wheel = entries(&weights);
        prop_assert_eq!(
            lucky_wheel(&wheel, seed, target),
            lucky_wheel(&wheel, seed, target)
        );
    }

    /// No address is picked twice and every pick is a real entry.
    #[test]
    fn selection_is_permutation_free(
        weights in prop::collection::vec(0u64..1_000_000, 1..32),
        seed in any::<u64>(),
        target in 0usize..40,
    ) {
        let wheel = entries(&weights);
        let picked = lucky_wheel(&wheel, seed, target);

        let unique: HashSet<_> = picked.iter().collect();
        prop_assert_eq!(unique.len(), picked.len(), "duplicate pick");

        let pool: HashSet<Address> = wheel.iter().map(|e| e.addr).collect();
        for addr in &picked {
            prop_assert!(pool.contains(addr));
        }
        prop_assert_eq!(picked.len(), target.min(wheel.len()));
    }
}
