//! Shared types and seams for the storage-client subsystems.
//!
//! This crate carries everything that more than one member needs:
//! - **Host model**: [`HostInfo`] with its scan-record ring and interaction
//!   counters, scored and maintained by the host pool
//! - **Rent budget**: [`RentPayment`], the client-level funding plan that
//!   drives host selection and contract renewal
//! - **Chain types**: storage contracts, revisions and unlock conditions
//!   ([`contracts`]), RLP-encoded for precompile payloads
//! - **Currency units**: the camel/dx parser ([`currency`], `1 dx = 10^18
//!   camel`)
//! - **Wire protocol**: negotiation message codes and framing ([`wire`])
//! - **Backend seams**: chain, wallet, host-session and sector-store traits
//!   ([`backend`]) implemented by the surrounding node
//!
//! # Block cadence
//!
//! The chain produces a block roughly every 15 seconds, so 240 blocks make an
//! hour. All durations expressed in blocks derive from that rate.

pub mod backend;
pub mod contracts;
pub mod currency;
pub mod wire;

use alloy_primitives::{Address, B256, U256};
use alloy_rlp::{Decodable, Encodable};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ============================================================================
// Block cadence
// ============================================================================

/// Blocks produced per minute (15 s block interval).
pub const BLOCK_PER_MIN: u64 = 4;
/// Blocks produced per hour.
pub const BLOCK_PER_HOUR: u64 = 240;
/// Blocks produced per day.
pub const BLOCKS_PER_DAY: u64 = 24 * BLOCK_PER_HOUR;
/// Blocks produced per week.
pub const BLOCKS_PER_WEEK: u64 = 7 * BLOCKS_PER_DAY;
/// Blocks produced per month.
pub const BLOCKS_PER_MONTH: u64 = 30 * BLOCKS_PER_DAY;
/// Blocks produced per year.
pub const BLOCKS_PER_YEAR: u64 = 365 * BLOCKS_PER_DAY;

/// Size of a storage sector in bytes (4 MiB). Sectors are the per-host unit
/// of upload, download and pricing.
pub const SECTOR_SIZE: u64 = 1 << 22;

/// Upper bound on the scan-record ring kept per host.
pub const MAX_SCAN_RECORDS: usize = 32;

// ============================================================================
// Identifiers
// ============================================================================

/// 32-byte identity of a storage host on the network overlay.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct EnodeId(pub B256);

/// 32-byte identity of a storage contract, derived from the keccak hash of
/// the RLP encoding of the unsigned contract.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ContractId(pub B256);

macro_rules! impl_id_wrapper {
    ($name:ident) => {
        impl $name {
            pub const ZERO: $name = $name(B256::ZERO);

            pub fn from_slice(bytes: &[u8]) -> Self {
                $name(B256::from_slice(bytes))
            }

            pub fn as_bytes(&self) -> &[u8; 32] {
                &self.0 .0
            }

            pub fn is_zero(&self) -> bool {
                self.0 == B256::ZERO
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl From<B256> for $name {
            fn from(inner: B256) -> Self {
                $name(inner)
            }
        }

        impl Encodable for $name {
            fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
                self.0.encode(out)
            }

            fn length(&self) -> usize {
                self.0.length()
            }
        }

        impl Decodable for $name {
            fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
                Ok($name(B256::decode(buf)?))
            }
        }
    };
}

impl_id_wrapper!(EnodeId);
impl_id_wrapper!(ContractId);

// ============================================================================
// Host model
// ============================================================================

/// Outcome of a single uptime probe against a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    /// Unix timestamp of the probe
    pub timestamp: u64,
    /// Whether the host answered with a valid config
    pub success: bool,
}

/// Interaction counters kept per host. Get-config probes are tracked both in
/// the aggregate counters and in their own subcategory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInteractions {
    pub successful: u64,
    pub failed: u64,
    pub successful_get_config: u64,
    pub failed_get_config: u64,
}

impl HostInteractions {
    /// Record one interaction, optionally under the get-config subcategory.
    pub fn record(&mut self, success: bool, get_config: bool) {
        if success {
            self.successful += 1;
            if get_config {
                self.successful_get_config += 1;
            }
        } else {
            self.failed += 1;
            if get_config {
                self.failed_get_config += 1;
            }
        }
    }
}

/// Economic terms a host advertises in its config response. Prices are in
/// camel; storage price and collateral are per byte per block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub accepting_contracts: bool,
    pub storage_price: U256,
    pub upload_bandwidth_price: U256,
    pub download_bandwidth_price: U256,
    pub collateral: U256,
    pub contract_price: U256,
    pub max_collateral: U256,
    pub max_deposit: U256,
    /// Blocks between a contract's end height and the end of its proof window
    pub window_size: u64,
    /// Unused capacity the host reports, in bytes
    pub remaining_storage: u64,
}

/// Everything the pool knows about a storage host.
///
/// `scan_records` is a bounded ring (capacity [`MAX_SCAN_RECORDS`]); the
/// historical uptime/downtime accumulators outlive the ring so long-term
/// reliability is not forgotten when old probes rotate out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostInfo {
    pub enode_id: EnodeId,
    /// Dialable enode URL of the host
    pub enode_url: String,
    /// Address the host wants contract payouts sent to
    pub payment_address: Address,
    /// IP the host was last seen at, used for subnet-conflict filtering
    pub ip: String,

    pub config: HostConfig,

    /// Block height at which this host first entered the pool
    pub first_seen: u64,
    /// Unix timestamp of the last time the host moved to a different subnet
    pub last_ip_network_change: u64,
    pub scan_records: VecDeque<ScanRecord>,
    /// Accumulated seconds the host was observed up
    pub historical_uptime: u64,
    /// Accumulated seconds the host was observed down
    pub historical_downtime: u64,
    pub interactions: HostInteractions,

    /// Populated on retrieval: whether the active filter mode excludes this
    /// host from contract formation
    #[serde(default)]
    pub filtered: bool,
}

impl HostInfo {
    /// Push a scan outcome onto the ring, evicting the oldest entry when the
    /// ring is full.
    pub fn push_scan_record(&mut self, record: ScanRecord) {
        if self.scan_records.len() == MAX_SCAN_RECORDS {
            self.scan_records.pop_front();
        }
        self.scan_records.push_back(record);
    }

    /// Fraction of observed time the host was up. Hosts without any
    /// observation history default to fully up.
    pub fn up_rate(&self) -> f64 {
        let total = self.historical_uptime + self.historical_downtime;
        if total == 0 {
            return 1.0;
        }
        self.historical_uptime as f64 / total as f64
    }

    /// Whether the most recent scan succeeded.
    pub fn last_scan_success(&self) -> bool {
        self.scan_records.back().map(|r| r.success).unwrap_or(false)
    }
}

// ============================================================================
// Rent payment
// ============================================================================

/// The client-level storage budget: how much the client is willing to spend
/// per period, across how many hosts, and what usage it expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RentPayment {
    /// Total camel the client is willing to spend per period
    pub fund: U256,
    /// Number of hosts the client wants contracts with
    pub storage_hosts: u64,
    /// Contract duration in blocks
    pub period: u64,
    /// Blocks before a contract's end height at which renewal starts
    pub renew_window: u64,
    /// Bytes of storage expected per period
    pub expected_storage: u64,
    /// Bytes of upload expected per period
    pub expected_upload: u64,
    /// Bytes of download expected per period
    pub expected_download: u64,
    /// Erasure-coding overhead factor applied to expected storage
    pub expected_redundancy: f64,
}

impl Default for RentPayment {
    fn default() -> Self {
        Self {
            fund: U256::from(10).pow(U256::from(18)),
            storage_hosts: 3,
            period: 3 * BLOCKS_PER_DAY,
            renew_window: 12 * BLOCK_PER_HOUR,
            expected_storage: 1_000_000_000_000, // 1 TB
            expected_upload: 200_000_000_000 / BLOCKS_PER_MONTH,
            expected_download: 100_000_000_000 / BLOCKS_PER_MONTH,
            expected_redundancy: 2.0,
        }
    }
}

// ============================================================================
// Contract status
// ============================================================================

/// Per-contract ability gates, flipped by the maintenance loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractStatus {
    /// Whether new sectors may be uploaded under this contract
    pub upload_ability: bool,
    /// Whether this contract may be renewed into a successor
    pub renew_ability: bool,
    /// Whether the contract has been canceled (host slot freed)
    pub canceled: bool,
}

/// The two booleans the repair engine needs about a host's contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContractUtility {
    pub good_for_upload: bool,
    pub good_for_renew: bool,
}

/// Source of per-host contract utility, implemented by the contract manager
/// and consumed by the repair engine when it decides which persisted sectors
/// still count toward a segment's completion.
pub trait ContractUtilitySource: Send + Sync {
    /// Utility of the contract with the given host, or `None` when the host
    /// holds no live contract.
    fn contract_utility(&self, host: &EnodeId) -> Option<ContractUtility>;
}
