//! Renewal-lineage graph invariants.
//!
//! Renewals insert into `renewed_from` and `renewed_to` together, always
//! renewing a currently-active contract into a brand-new id. Under that
//! discipline the maps must stay exact inverses and the graph a forest of
//! linear chains.

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;

use common::ContractId;

fn id(n: u64) -> ContractId {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&n.to_be_bytes());
    ContractId::from_slice(&bytes)
}

/// Replay a random renewal schedule the way the contract manager records it.
fn build_graph(
    initial: u64,
    picks: &[usize],
) -> (
    HashMap<ContractId, ContractId>,
    HashMap<ContractId, ContractId>,
    HashSet<ContractId>,
) {
    let mut renewed_from = HashMap::new();
    let mut renewed_to = HashMap::new();
    let mut active: Vec<ContractId> = (0..initial).map(id).collect();
    let mut next_id = initial;

    for pick in picks {
        if active.is_empty() {
            break;
        }
        let old = active[pick % active.len()];
        let new = id(next_id);
        next_id += 1;

        renewed_from.insert(new, old);
        renewed_to.insert(old, new);
        active.retain(|c| *c != old);
        active.push(new);
    }
    (renewed_from, renewed_to, active.into_iter().collect())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn maps_stay_inverse_and_acyclic(
        initial in 1u64..8,
        picks in prop::collection::vec(any::<usize>(), 0..64),
    ) {
        let (renewed_from, renewed_to, active) = build_graph(initial, &picks);

        // Inverse in both directions
        for (new, old) in &renewed_from {
            prop_assert_eq!(renewed_to.get(old), Some(new));
        }
        for (old, new) in &renewed_to {
            prop_assert_eq!(renewed_from.get(new), Some(old));
        }

        // Linear chains: every id has at most one successor and one
        // predecessor, and walking forward from any id terminates
        for start in renewed_to.keys() {
            let mut seen = HashSet::new();
            let mut cursor = *start;
            while let Some(next) = renewed_to.get(&cursor) {
                prop_assert!(seen.insert(*next), "cycle through {next}");
                cursor = *next;
            }
            // Chains end at an active contract
            prop_assert!(active.contains(&cursor));
        }

        // An id never renews twice: the renewed set and the active set are
        // disjoint
        for old in renewed_to.keys() {
            prop_assert!(!active.contains(old));
        }
    }
}
