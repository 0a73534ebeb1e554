//! Precompiled-contract transaction submission.
//!
//! The storage and DPoS subsystems both talk to the chain through a fixed set
//! of precompiled contracts, addressed 0x09 through 0x10. This crate owns the
//! shared submission path: argument assembly, the per-address nonce lock, and
//! the construct → sign → submit sequence.
//!
//! The nonce lock is held across the whole sequence so two concurrent
//! submissions from one address cannot observe the same pool nonce. An
//! in-flight submission is never canceled: aborting after `pool_nonce` but
//! before `send_raw_transaction` would leave a nonce gap that blocks every
//! later transaction from that address.

use std::sync::Arc;

use alloy_primitives::{Address, Bytes, B256, U256};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use common::backend::{ChainBackend, ChainError, Transaction, Wallet, WalletError};

// Precompiled contract addresses, one per operation.
pub const HOST_ANNOUNCE_ADDR: Address = Address::with_last_byte(0x09);
pub const CONTRACT_CREATE_ADDR: Address = Address::with_last_byte(0x0a);
pub const CONTRACT_REVISION_ADDR: Address = Address::with_last_byte(0x0b);
pub const STORAGE_PROOF_ADDR: Address = Address::with_last_byte(0x0c);
pub const APPLY_CANDIDATE_ADDR: Address = Address::with_last_byte(0x0d);
pub const CANCEL_CANDIDATE_ADDR: Address = Address::with_last_byte(0x0e);
pub const VOTE_ADDR: Address = Address::with_last_byte(0x0f);
pub const CANCEL_VOTE_ADDR: Address = Address::with_last_byte(0x10);

/// Fixed gas budget for storage-contract transactions.
pub const STORAGE_CONTRACT_TX_GAS: u64 = 90_000;

/// Fixed gas budget for DPoS transactions.
pub const DPOS_TX_GAS: u64 = 1_000_000;

#[derive(Debug, Error)]
pub enum ChainTxError {
    #[error("precompiled contract tx without recipient")]
    MissingRecipient,
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Wallet(#[from] WalletError),
}

/// Arguments for one precompiled-contract transaction. Gas price and nonce
/// are filled in at submission time under the nonce lock.
#[derive(Debug, Clone)]
pub struct PrecompiledTxArgs {
    pub from: Address,
    pub to: Address,
    pub gas: u64,
    pub value: U256,
    pub input: Bytes,
}

impl PrecompiledTxArgs {
    pub fn new(from: Address, to: Address, input: impl Into<Bytes>, value: U256, gas: u64) -> Self {
        Self {
            from,
            to,
            gas,
            value,
            input: input.into(),
        }
    }

    /// Resolve gas price and nonce against the chain and produce the
    /// transaction to sign. Callers must hold the address's nonce lock.
    pub async fn build_transaction(
        &self,
        backend: &dyn ChainBackend,
    ) -> Result<Transaction, ChainTxError> {
        if self.to == Address::ZERO {
            return Err(ChainTxError::MissingRecipient);
        }
        let gas_price = backend.suggest_gas_price().await?;
        let nonce = backend.pool_nonce(self.from).await?;
        Ok(Transaction {
            nonce,
            to: self.to,
            value: self.value,
            gas: self.gas,
            gas_price,
            input: self.input.clone(),
        })
    }
}

/// Per-address submission locks. Nonce assignment and submission must be
/// atomic per sender; the lock table grows one entry per distinct address.
#[derive(Default)]
pub struct AddrLocker {
    locks: DashMap<Address, Arc<Mutex<()>>>,
}

impl AddrLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the submission lock for an address. The guard must be held until
    /// the transaction has been handed to the pool.
    pub async fn lock(&self, address: Address) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(address)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

/// Construct, sign and submit a precompiled-contract transaction.
///
/// Returns the hash of the submitted transaction.
pub async fn send_precompiled_tx(
    backend: &dyn ChainBackend,
    wallet: &dyn Wallet,
    nonce_lock: &AddrLocker,
    args: &PrecompiledTxArgs,
) -> Result<B256, ChainTxError> {
    let _guard = nonce_lock.lock(args.from).await;

    let tx = args.build_transaction(backend).await?;
    let signed = wallet.sign_transaction(args.from, &tx, backend.chain_id())?;
    let hash = backend.send_raw_transaction(signed).await?;

    debug!(
        from = %args.from,
        to = %args.to,
        nonce = tx.nonce,
        tx = %hash,
        "Submitted precompiled contract tx"
    );
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use tokio::sync::broadcast;

    /// Backend that records submissions and hands out sequential nonces.
    struct MockBackend {
        nonce: PlMutex<u64>,
        submitted: PlMutex<Vec<(u64, Bytes)>>,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                nonce: PlMutex::new(0),
                submitted: PlMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChainBackend for MockBackend {
        async fn block_height(&self) -> Result<u64, ChainError> {
            Ok(100)
        }

        fn chain_id(&self) -> Option<u64> {
            Some(1)
        }

        async fn balance(&self, _address: Address) -> Result<U256, ChainError> {
            Ok(U256::ZERO)
        }

        async fn state_value(&self, _address: Address, _key: B256) -> Result<B256, ChainError> {
            Ok(B256::ZERO)
        }

        async fn suggest_gas_price(&self) -> Result<U256, ChainError> {
            Ok(U256::from(1_000_000_000u64))
        }

        async fn pool_nonce(&self, _address: Address) -> Result<u64, ChainError> {
            // Yield so concurrent submitters interleave if unserialized
            tokio::task::yield_now().await;
            Ok(*self.nonce.lock())
        }

        async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, ChainError> {
            let mut nonce = self.nonce.lock();
            self.submitted.lock().push((*nonce, raw.clone()));
            *nonce += 1;
            Ok(alloy_primitives::keccak256(&raw))
        }

        fn subscribe_blocks(&self) -> broadcast::Receiver<u64> {
            broadcast::channel(1).1
        }

        fn online(&self) -> bool {
            true
        }

        fn synced(&self) -> bool {
            true
        }
    }

    struct MockWallet;

    impl Wallet for MockWallet {
        fn sign_digest(&self, _address: Address, digest: B256) -> Result<Bytes, WalletError> {
            Ok(Bytes::copy_from_slice(digest.as_slice()))
        }

        fn sign_transaction(
            &self,
            _address: Address,
            tx: &Transaction,
            _chain_id: Option<u64>,
        ) -> Result<Bytes, WalletError> {
            let mut raw = tx.nonce.to_be_bytes().to_vec();
            raw.extend_from_slice(&tx.input);
            Ok(raw.into())
        }
    }

    #[tokio::test]
    async fn rejects_zero_recipient() {
        let backend = MockBackend::new();
        let args = PrecompiledTxArgs::new(
            Address::repeat_byte(1),
            Address::ZERO,
            vec![1u8],
            U256::ZERO,
            DPOS_TX_GAS,
        );
        let err = args.build_transaction(&backend).await.unwrap_err();
        assert!(matches!(err, ChainTxError::MissingRecipient));
    }

    #[tokio::test]
    async fn concurrent_submissions_never_reuse_a_nonce() {
        let backend = Arc::new(MockBackend::new());
        let locker = Arc::new(AddrLocker::new());
        let from = Address::repeat_byte(5);

        let mut handles = Vec::new();
        for i in 0..8u8 {
            let backend = backend.clone();
            let locker = locker.clone();
            handles.push(tokio::spawn(async move {
                let args = PrecompiledTxArgs::new(
                    from,
                    CONTRACT_CREATE_ADDR,
                    vec![i],
                    U256::ZERO,
                    STORAGE_CONTRACT_TX_GAS,
                );
                send_precompiled_tx(backend.as_ref(), &MockWallet, &locker, &args)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let submitted = backend.submitted.lock();
        assert_eq!(submitted.len(), 8);
        // The signed payload embeds the nonce it was built with; it must
        // match the nonce the pool observed at submission time.
        for (pool_nonce, raw) in submitted.iter() {
            let built_nonce = u64::from_be_bytes(raw[..8].try_into().unwrap());
            assert_eq!(built_nonce, *pool_nonce);
        }
    }

    #[test]
    fn precompile_addresses_are_distinct_and_ordered() {
        let addrs = [
            HOST_ANNOUNCE_ADDR,
            CONTRACT_CREATE_ADDR,
            CONTRACT_REVISION_ADDR,
            STORAGE_PROOF_ADDR,
            APPLY_CANDIDATE_ADDR,
            CANCEL_CANDIDATE_ADDR,
            VOTE_ADDR,
            CANCEL_VOTE_ADDR,
        ];
        for (i, addr) in addrs.iter().enumerate() {
            assert_eq!(addr.0[19], 0x09 + i as u8);
        }
    }
}
