//! Property-based tests for the storage-client invariants.
//!
//! Each module covers one invariant family:
//! - `heap`: upload-heap ordering and the heap/repairing membership rule
//! - `lineage`: the renewal lineage maps stay inverse and acyclic
//! - `payout`: the contract payout formula's caps and balances
//! - `selector`: lucky-wheel determinism and permutation-freedom
//! - `host`: scan-record ring bounds and uptime partitioning
//! - `currency`: camel/dx parser round-trips

pub mod strategies;

#[cfg(test)]
mod currency;
#[cfg(test)]
mod heap;
#[cfg(test)]
mod host;
#[cfg(test)]
mod lineage;
#[cfg(test)]
mod payout;
#[cfg(test)]
mod selector;
