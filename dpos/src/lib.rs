//! DPoS precompile gate: candidate/vote transaction validation & submission.
//!
//! Four transaction kinds exist, routed by destination precompile address:
//! apply-candidate (0x0d), cancel-candidate (0x0e), vote (0x0f) and
//! cancel-vote (0x10). Each is validated against current chain state before
//! it is signed and handed to the pool; an invalid transaction must never
//! reach the chain, where its failure would still burn gas.
//!
//! The kind set is closed: [`DposOp`] is decoded from the destination
//! address and dispatched with an exhaustive match, so adding a precompile
//! forces every validation site to be revisited.

pub mod selector;

use std::collections::HashMap;

use alloy_primitives::{Address, B256, U256};
use thiserror::Error;
use tracing::debug;

use chain_tx::{
    send_precompiled_tx, AddrLocker, ChainTxError, PrecompiledTxArgs, APPLY_CANDIDATE_ADDR,
    CANCEL_CANDIDATE_ADDR, CANCEL_VOTE_ADDR, DPOS_TX_GAS, VOTE_ADDR,
};
use common::backend::{ChainBackend, ChainError, Wallet};
use common::currency::{parse_currency, CurrencyError};

/// Max number of candidates a single vote transaction may name.
pub const MAX_VOTE_COUNT: usize = 30;

/// Election cycle length in seconds.
pub const EPOCH_INTERVAL: u64 = 86_400;

/// Canceled deposits thaw after this many epochs.
pub const THAWING_EPOCH_DURATION: u64 = 2;

/// Award distribution ratio is a percentage.
pub const REWARD_RATIO_DENOMINATOR: u64 = 100;

/// State slot holding an address's candidate deposit.
pub const KEY_CANDIDATE_DEPOSIT: B256 = B256::new(*b"dpos-candidate-deposit\0\0\0\0\0\0\0\0\0\0");

/// State slot holding an address's vote deposit.
pub const KEY_VOTE_DEPOSIT: B256 = B256::new(*b"dpos-vote-deposit\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0");

/// Minimum deposit to apply as candidate: 1 dx.
pub fn min_deposit() -> U256 {
    U256::from(10).pow(U256::from(18))
}

/// Minimum balance to apply as candidate: 1 dx. Stops candidate-application
/// flooding from dust accounts.
pub fn candidate_threshold() -> U256 {
    U256::from(10).pow(U256::from(18))
}

/// Epoch an instant belongs to.
pub fn calculate_epoch_id(unix_secs: u64) -> u64 {
    unix_secs / EPOCH_INTERVAL
}

#[derive(Debug, Error)]
pub enum DposError {
    #[error("balance is below the candidate threshold")]
    BalanceBelowCandidateThreshold,
    #[error("deposit value is not suitable for the current balance")]
    DepositValueNotSuitable,
    #[error("candidate deposit is below the minimum deposit")]
    CandidateDepositTooLow,
    #[error("address has not become a candidate")]
    NotCandidate,
    #[error("address has not voted")]
    HasNotVoted,
    #[error("vote transaction carries no candidate input")]
    EmptyVoteInput,
    #[error("vote names more than {MAX_VOTE_COUNT} candidates")]
    BeyondMaxVoteCount,
    #[error("award distribution ratio must be an integer in 0..=100")]
    InvalidAwardDistributionRatio,
    #[error("destination {0} is not a dpos precompile")]
    UnknownPrecompileAddress(Address),
    #[error("unknown parameter {0:?}")]
    UnknownParameter(String),
    #[error("field {field:?} is malformed: {reason}")]
    MalformedField {
        field: &'static str,
        reason: String,
    },
    #[error(transparent)]
    Currency(#[from] CurrencyError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Tx(#[from] ChainTxError),
}

/// The closed set of DPoS operations, tagged by precompile address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DposOp {
    ApplyCandidate,
    CancelCandidate,
    Vote,
    CancelVote,
}

impl DposOp {
    /// Decode an operation from its destination precompile address.
    pub fn from_address(to: Address) -> Result<Self, DposError> {
        if to == APPLY_CANDIDATE_ADDR {
            Ok(DposOp::ApplyCandidate)
        } else if to == CANCEL_CANDIDATE_ADDR {
            Ok(DposOp::CancelCandidate)
        } else if to == VOTE_ADDR {
            Ok(DposOp::Vote)
        } else if to == CANCEL_VOTE_ADDR {
            Ok(DposOp::CancelVote)
        } else {
            Err(DposError::UnknownPrecompileAddress(to))
        }
    }

    pub fn address(&self) -> Address {
        match self {
            DposOp::ApplyCandidate => APPLY_CANDIDATE_ADDR,
            DposOp::CancelCandidate => CANCEL_CANDIDATE_ADDR,
            DposOp::Vote => VOTE_ADDR,
            DposOp::CancelVote => CANCEL_VOTE_ADDR,
        }
    }
}

/// Read a deposit bookkeeping slot as an amount.
async fn deposit_slot(
    backend: &dyn ChainBackend,
    address: Address,
    key: B256,
) -> Result<U256, DposError> {
    let raw = backend.state_value(address, key).await?;
    Ok(U256::from_be_bytes(raw.0))
}

/// Validate a DPoS transaction against current chain state.
///
/// Dispatch is an exhaustive match over [`DposOp`]; validation rules mirror
/// what the precompiles themselves enforce, so a transaction passing here is
/// expected to execute.
pub async fn validate_dpos_tx(
    backend: &dyn ChainBackend,
    args: &PrecompiledTxArgs,
) -> Result<(), DposError> {
    let op = DposOp::from_address(args.to)?;
    let balance = backend.balance(args.from).await?;

    match op {
        DposOp::ApplyCandidate => {
            if balance < candidate_threshold() {
                return Err(DposError::BalanceBelowCandidateThreshold);
            }
            // The address may already be a delegator; only the balance not
            // backing its vote deposit may be pledged.
            let vote_deposit = deposit_slot(backend, args.from, KEY_VOTE_DEPOSIT).await?;
            let allowed = balance.saturating_sub(vote_deposit);
            if args.value.is_zero() || args.value > allowed {
                return Err(DposError::DepositValueNotSuitable);
            }
            if args.value < min_deposit() {
                return Err(DposError::CandidateDepositTooLow);
            }
            Ok(())
        }
        DposOp::CancelCandidate => {
            let deposit = deposit_slot(backend, args.from, KEY_CANDIDATE_DEPOSIT).await?;
            if deposit.is_zero() {
                return Err(DposError::NotCandidate);
            }
            Ok(())
        }
        DposOp::Vote => {
            if args.input.is_empty() {
                return Err(DposError::EmptyVoteInput);
            }
            let candidate_deposit =
                deposit_slot(backend, args.from, KEY_CANDIDATE_DEPOSIT).await?;
            let allowed = balance.saturating_sub(candidate_deposit);
            if args.value.is_zero() || args.value > allowed {
                return Err(DposError::DepositValueNotSuitable);
            }
            Ok(())
        }
        DposOp::CancelVote => {
            let deposit = deposit_slot(backend, args.from, KEY_VOTE_DEPOSIT).await?;
            if deposit.is_zero() {
                return Err(DposError::HasNotVoted);
            }
            Ok(())
        }
    }
}

/// Parse RPC-shaped string fields into precompiled-contract tx arguments.
///
/// Recognized fields: `from` (hex address), `deposit` (currency string,
/// becomes the tx value), `ratio` (decimal 0..=100, becomes a single-byte
/// payload), `candidates` (comma-separated hex addresses, becomes an
/// RLP-encoded list). Any other key is rejected.
pub fn parse_dpos_tx_fields(
    to: Address,
    gas: u64,
    fields: &HashMap<String, String>,
) -> Result<PrecompiledTxArgs, DposError> {
    let mut from = Address::ZERO;
    let mut value = U256::ZERO;
    let mut input: Vec<u8> = Vec::new();

    for (key, raw) in fields {
        match key.as_str() {
            "from" => {
                from = raw.parse().map_err(|e| DposError::MalformedField {
                    field: "from",
                    reason: format!("{e}"),
                })?;
            }
            "deposit" => {
                value = parse_currency(raw)?;
            }
            "ratio" => {
                let ratio: u64 = raw
                    .parse()
                    .map_err(|_| DposError::InvalidAwardDistributionRatio)?;
                if ratio > REWARD_RATIO_DENOMINATOR {
                    return Err(DposError::InvalidAwardDistributionRatio);
                }
                input = vec![ratio as u8];
            }
            "candidates" => {
                let mut candidates = Vec::new();
                for part in raw.split(',') {
                    let addr: Address =
                        part.trim().parse().map_err(|e| DposError::MalformedField {
                            field: "candidates",
                            reason: format!("{e}"),
                        })?;
                    candidates.push(addr);
                }
                if candidates.len() > MAX_VOTE_COUNT {
                    return Err(DposError::BeyondMaxVoteCount);
                }
                input = alloy_rlp::encode(&candidates);
            }
            other => return Err(DposError::UnknownParameter(other.to_string())),
        }
    }

    Ok(PrecompiledTxArgs::new(from, to, input, value, gas))
}

/// Parse, validate and submit an apply-candidate transaction.
pub async fn send_apply_candidate_tx(
    backend: &dyn ChainBackend,
    wallet: &dyn Wallet,
    nonce_lock: &AddrLocker,
    fields: &HashMap<String, String>,
) -> Result<B256, DposError> {
    let args = parse_dpos_tx_fields(APPLY_CANDIDATE_ADDR, DPOS_TX_GAS, fields)?;
    validate_dpos_tx(backend, &args).await?;
    let hash = send_precompiled_tx(backend, wallet, nonce_lock, &args).await?;
    debug!(from = %args.from, tx = %hash, "Apply-candidate tx submitted");
    Ok(hash)
}

/// Validate and submit a cancel-candidate transaction.
pub async fn send_cancel_candidate_tx(
    backend: &dyn ChainBackend,
    wallet: &dyn Wallet,
    nonce_lock: &AddrLocker,
    from: Address,
) -> Result<B256, DposError> {
    let args = PrecompiledTxArgs::new(from, CANCEL_CANDIDATE_ADDR, Vec::new(), U256::ZERO, DPOS_TX_GAS);
    validate_dpos_tx(backend, &args).await?;
    Ok(send_precompiled_tx(backend, wallet, nonce_lock, &args).await?)
}

/// Parse, validate and submit a vote transaction.
pub async fn send_vote_tx(
    backend: &dyn ChainBackend,
    wallet: &dyn Wallet,
    nonce_lock: &AddrLocker,
    fields: &HashMap<String, String>,
) -> Result<B256, DposError> {
    let args = parse_dpos_tx_fields(VOTE_ADDR, DPOS_TX_GAS, fields)?;
    validate_dpos_tx(backend, &args).await?;
    let hash = send_precompiled_tx(backend, wallet, nonce_lock, &args).await?;
    debug!(from = %args.from, tx = %hash, "Vote tx submitted");
    Ok(hash)
}

/// Validate and submit a cancel-vote transaction.
pub async fn send_cancel_vote_tx(
    backend: &dyn ChainBackend,
    wallet: &dyn Wallet,
    nonce_lock: &AddrLocker,
    from: Address,
) -> Result<B256, DposError> {
    let args = PrecompiledTxArgs::new(from, CANCEL_VOTE_ADDR, Vec::new(), U256::ZERO, DPOS_TX_GAS);
    validate_dpos_tx(backend, &args).await?;
    Ok(send_precompiled_tx(backend, wallet, nonce_lock, &args).await?)
}
