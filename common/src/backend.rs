//! Seams to the surrounding node.
//!
//! The storage client does not own a chain, a wallet, a transport or a
//! sector store; it drives all four through the traits here. Implementations
//! live in the node binary (chain + wallet), the networking layer (host
//! sessions) and the on-disk sector engine.
//!
//! None of these calls may be made while holding a subsystem lock: every one
//! of them is allowed to block on I/O.

use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::wire::Frame;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("transaction rejected by pool: {0}")]
    PoolRejected(String),
    #[error("chain backend unavailable: {0}")]
    Unavailable(String),
    #[error("state query failed: {0}")]
    StateQuery(String),
}

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("no wallet holds account {0}")]
    UnknownAccount(Address),
    #[error("wallet is locked for account {0}")]
    Locked(Address),
    #[error("signing failed: {0}")]
    SignFailed(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to reach host: {0}")]
    Connect(String),
    #[error("session i/o failed: {0}")]
    Io(String),
    #[error("session closed by peer")]
    Closed,
}

#[derive(Debug, Error)]
pub enum SectorStoreError {
    #[error("sector {0} not found")]
    NotFound(B256),
    #[error("sector store i/o failed: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum MerkleSourceError {
    #[error("merkle source exhausted")]
    Exhausted,
    #[error("merkle source i/o failed: {0}")]
    Io(String),
}

/// A transaction as handed to the wallet for signing. The storage client only
/// ever produces precompiled-contract calls, so there is no contract-creation
/// variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub nonce: u64,
    pub to: Address,
    pub value: U256,
    pub gas: u64,
    pub gas_price: U256,
    pub input: Bytes,
}

/// Read access to the chain plus transaction submission.
#[async_trait]
pub trait ChainBackend: Send + Sync {
    async fn block_height(&self) -> Result<u64, ChainError>;

    /// Chain id for replay-protected signing, `None` before the fork height.
    fn chain_id(&self) -> Option<u64>;

    async fn balance(&self, address: Address) -> Result<U256, ChainError>;

    /// Raw state slot read, used for the DPoS deposit bookkeeping keys.
    async fn state_value(&self, address: Address, key: B256) -> Result<B256, ChainError>;

    async fn suggest_gas_price(&self) -> Result<U256, ChainError>;

    /// Next usable nonce for the address, including pool-pending txs.
    async fn pool_nonce(&self, address: Address) -> Result<u64, ChainError>;

    /// Submit a signed raw transaction, returning its hash.
    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, ChainError>;

    /// New-block notifications driving the maintenance cadence.
    fn subscribe_blocks(&self) -> broadcast::Receiver<u64>;

    /// Whether the node has peers.
    fn online(&self) -> bool;

    /// Whether the node believes it is at the chain head.
    fn synced(&self) -> bool;
}

/// Digest and transaction signing, keyed by account address.
pub trait Wallet: Send + Sync {
    fn sign_digest(&self, address: Address, digest: B256) -> Result<Bytes, WalletError>;

    fn sign_transaction(
        &self,
        address: Address,
        tx: &Transaction,
        chain_id: Option<u64>,
    ) -> Result<Bytes, WalletError>;
}

/// A framed, ordered byte stream to one host.
#[async_trait]
pub trait HostSession: Send {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), SessionError>;

    async fn read_frame(&mut self) -> Result<Frame, SessionError>;

    /// Tear the stream down. Must be safe to call after an error.
    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Opens negotiation sessions to hosts by enode URL.
#[async_trait]
pub trait HostConnector: Send + Sync {
    async fn open_session(&self, enode_url: &str) -> Result<Box<dyn HostSession>, SessionError>;
}

/// Byte-addressable append+read of fixed-size sectors, keyed by merkle root.
#[async_trait]
pub trait SectorStore: Send + Sync {
    async fn append_sector(&self, root: B256, data: &[u8]) -> Result<(), SectorStoreError>;

    async fn read_sector(&self, root: B256) -> Result<Vec<u8>, SectorStoreError>;

    fn sector_size(&self) -> u64;
}

/// Streaming source of leaf roots for diff-proof verification.
pub trait LeafRoot {
    fn leaf_root(&mut self) -> Result<B256, MerkleSourceError>;
}

/// Streaming source of subtree roots for diff-proof construction.
pub trait SubtreeRoot {
    fn subtree_root(&mut self, leaves: usize) -> Result<B256, MerkleSourceError>;

    fn skip(&mut self, leaves: usize) -> Result<(), MerkleSourceError>;
}
