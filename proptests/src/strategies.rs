//! Shared proptest strategies.

use alloy_primitives::{Address, U256};
use proptest::prelude::*;

use common::EnodeId;

/// A 32-byte enode id from a single seed byte, so ids collide predictably.
pub fn enode_id() -> impl Strategy<Value = EnodeId> {
    any::<[u8; 32]>().prop_map(|bytes| EnodeId::from_slice(&bytes))
}

/// A small, distinct address keyed by one byte.
pub fn address() -> impl Strategy<Value = Address> {
    any::<u8>().prop_map(Address::repeat_byte)
}

/// A currency amount that stays comfortably inside u128 arithmetic.
pub fn amount() -> impl Strategy<Value = U256> {
    (0u128..u128::MAX / 2).prop_map(U256::from)
}

/// A `(stuck, completed, need)` triple describing a segment's priority.
pub fn segment_priority() -> impl Strategy<Value = (bool, usize, usize)> {
    (any::<bool>(), 1usize..=64).prop_flat_map(|(stuck, need)| {
        (Just(stuck), 0..=need, Just(need))
    })
}
