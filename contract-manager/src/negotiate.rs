//! Contract create/renew negotiation.
//!
//! A five-round handshake with the host:
//!
//! 1. draft the storage contract from rent terms, host terms and funding
//! 2. send the draft + client contract signature, collect the host's
//! 3. send the client's signature over revision 1, collect the host's
//! 4. submit the precompiled contract-create transaction
//! 5. commit the contract locally, acknowledge, await the host's ack
//!
//! Either side may abort with a typed negotiation error. A busy host
//! (0x27) is surfaced as [`NegotiationError::HostBusy`] and must not debit
//! the host's score; every other failure counts against it.

use alloy_primitives::{Address, Bytes, B256, U256};
use thiserror::Error;
use tracing::{debug, error};

use chain_tx::{send_precompiled_tx, ChainTxError, PrecompiledTxArgs, CONTRACT_CREATE_ADDR, STORAGE_CONTRACT_TX_GAS};
use common::backend::{HostSession, SessionError, WalletError};
use common::contracts::{
    PaymentOutput, StorageContract, StorageContractRevision, UnlockConditions,
};
use common::wire::{
    decode_negotiation_error, ContractCreateRequest, ContractRevisionSign, Frame, WireError,
    CLIENT_STOP_MSG, CONTRACT_CREATE_CLIENT_REVISION_SIGN_MSG, CONTRACT_CREATE_HOST_SIGN_MSG,
    CONTRACT_CREATE_REQ_MSG, CONTRACT_CREATE_REVISION_SIGN_MSG, HOST_BUSY_MSG, HOST_STOP_MSG,
    NEGOTIATION_ERROR_MSG,
};
use common::{ContractId, ContractStatus, HostInfo, RentPayment};

use crate::contract_set::ContractHeader;
use crate::ContractManager;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("host declined: {0}")]
    HostDeclined(String),
    #[error("host is busy handling a previous request")]
    HostBusy,
    #[error("host shut down mid-negotiation")]
    HostStopped,
    #[error("unexpected message code {0:#04x}")]
    UnexpectedMessage(u8),
    #[error("funding {funding} does not cover contract price {contract_price} plus base price")]
    InsufficientFunding {
        funding: U256,
        contract_price: U256,
    },
    #[error("storage host {0} is unknown to the pool")]
    UnknownHost(common::EnodeId),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Wallet(#[from] WalletError),
    #[error(transparent)]
    Tx(#[from] ChainTxError),
    #[error("failed to commit contract locally: {0}")]
    Commit(String),
}

impl NegotiationError {
    /// Busy hosts asked us to come back later; that is not a failure of the
    /// host and must not debit its score.
    pub fn debits_host_score(&self) -> bool {
        !matches!(self, NegotiationError::HostBusy)
    }
}

/// Everything a single negotiation needs.
#[derive(Debug, Clone)]
pub struct ContractParams {
    pub rent_payment: RentPayment,
    pub host: HostInfo,
    pub funding: U256,
    pub start_height: u64,
    pub end_height: u64,
    pub client_payment_address: Address,
}

/// The payout formula: split `funding` between the client payout and the
/// host's collateralized payout.
///
/// Returns `(client_payout, host_payout, host_collateral)`. The host's
/// collateral is capped both by five times the client's expected commitment
/// and by the host's own `max_collateral`.
pub fn calculate_payouts_and_host_deposit(
    host: &HostInfo,
    funding: U256,
    base_price: U256,
    base_collateral: U256,
    period: u64,
    expected_storage: u64,
) -> Result<(U256, U256, U256), NegotiationError> {
    // Divide-by-zero guard
    let storage_price = if host.config.storage_price.is_zero() {
        U256::from(1u64)
    } else {
        host.config.storage_price
    };
    let contract_price = host.config.contract_price;

    // Underflow check
    let client_payout = funding
        .checked_sub(contract_price + base_price)
        .filter(|p| !p.is_zero())
        .ok_or(NegotiationError::InsufficientFunding {
            funding,
            contract_price,
        })?;

    let max_by_budget = client_payout / storage_price * host.config.collateral;
    let mut host_collateral = max_by_budget + base_collateral;

    let max_client_cap = host.config.collateral
        * U256::from(period)
        * U256::from(expected_storage)
        * U256::from(5u64);
    host_collateral = host_collateral.min(max_client_cap);

    // Never more collateral than the host puts into a single contract
    host_collateral = host_collateral.min(host.config.max_collateral);

    let host_payout = host_collateral + contract_price + base_price;
    Ok((client_payout, host_payout, host_collateral))
}

/// Draft a fresh storage contract for the create path (no data yet, so zero
/// file size and an empty merkle root).
pub fn draft_storage_contract(
    host: &HostInfo,
    rent: &RentPayment,
    funding: U256,
    start_height: u64,
    end_height: u64,
    client_payment_address: Address,
    uc: &UnlockConditions,
) -> Result<StorageContract, NegotiationError> {
    let period = end_height.saturating_sub(start_height);
    let expected_storage = rent.expected_storage / rent.storage_hosts.max(1);
    let (client_payout, host_payout, _) = calculate_payouts_and_host_deposit(
        host,
        funding,
        U256::ZERO,
        U256::ZERO,
        period,
        expected_storage,
    )?;

    Ok(StorageContract {
        file_size: 0,
        file_merkle_root: B256::ZERO, // no proof possible without data
        window_start: end_height,
        window_end: end_height + host.config.window_size,
        client_collateral: PaymentOutput {
            value: client_payout,
            address: client_payment_address,
        },
        host_collateral: PaymentOutput {
            value: host_payout,
            address: host.payment_address,
        },
        valid_proof_outputs: vec![
            // Deposit is returned to client
            PaymentOutput {
                value: client_payout,
                address: client_payment_address,
            },
            // Deposit is returned to host
            PaymentOutput {
                value: host_payout,
                address: host.payment_address,
            },
        ],
        missed_proof_outputs: vec![
            PaymentOutput {
                value: client_payout,
                address: client_payment_address,
            },
            PaymentOutput {
                value: host_payout,
                address: host.payment_address,
            },
        ],
        unlock_hash: uc.unlock_hash(),
        revision_number: 0,
        signatures: Vec::new(),
    })
}

/// Draft the successor contract for a renew, extending the previous
/// revision's commitment.
///
/// The base price and collateral cover the already-uploaded data across the
/// window extension; on a missed proof the host forfeits the extension
/// collateral.
pub fn draft_renewed_contract(
    host: &HostInfo,
    rent: &RentPayment,
    funding: U256,
    start_height: u64,
    end_height: u64,
    client_payment_address: Address,
    last_revision: &StorageContractRevision,
) -> Result<StorageContract, NegotiationError> {
    let new_window_end = end_height + host.config.window_size;
    let (mut base_price, mut base_collateral) = (U256::ZERO, U256::ZERO);
    if new_window_end > last_revision.new_window_end {
        let extension = U256::from(new_window_end - last_revision.new_window_end);
        let file_size = U256::from(last_revision.new_file_size);
        // Cost of already uploaded data that the renewed contract must carry
        base_price = host.config.storage_price * file_size * extension;
        base_collateral = host.config.collateral * file_size * extension;
    }

    let period = end_height.saturating_sub(start_height);
    let expected_storage = rent.expected_storage / rent.storage_hosts.max(1);
    let (client_payout, host_payout, host_collateral) = calculate_payouts_and_host_deposit(
        host,
        funding,
        base_price,
        base_collateral,
        period,
        expected_storage,
    )?;

    // The collateral caps may have clamped below the base component
    if host_collateral < base_collateral {
        base_collateral = host_collateral;
    }
    let host_missed = host_collateral - base_collateral + host.config.contract_price;

    Ok(StorageContract {
        file_size: last_revision.new_file_size,
        file_merkle_root: last_revision.new_file_merkle_root,
        window_start: end_height,
        window_end: new_window_end,
        client_collateral: PaymentOutput {
            value: client_payout,
            address: client_payment_address,
        },
        host_collateral: PaymentOutput {
            value: host_payout,
            address: host.payment_address,
        },
        valid_proof_outputs: vec![
            PaymentOutput {
                value: client_payout,
                address: client_payment_address,
            },
            PaymentOutput {
                value: host_payout,
                address: host.payment_address,
            },
        ],
        missed_proof_outputs: vec![
            PaymentOutput {
                value: client_payout,
                address: client_payment_address,
            },
            PaymentOutput {
                value: host_missed,
                address: host.payment_address,
            },
        ],
        unlock_hash: last_revision.new_unlock_hash,
        revision_number: 0,
        signatures: Vec::new(),
    })
}

/// Read the next frame, translating the error codes. `expected` wins over
/// everything, so a host ack of 0x28 can be awaited explicitly.
async fn read_expected(
    session: &mut dyn HostSession,
    expected: u8,
) -> Result<Frame, NegotiationError> {
    let frame = session.read_frame().await?;
    if frame.code == expected {
        return Ok(frame);
    }
    match frame.code {
        NEGOTIATION_ERROR_MSG => Err(NegotiationError::HostDeclined(decode_negotiation_error(
            &frame.payload,
        )?)),
        HOST_BUSY_MSG => Err(NegotiationError::HostBusy),
        HOST_STOP_MSG => Err(NegotiationError::HostStopped),
        code => Err(NegotiationError::UnexpectedMessage(code)),
    }
}

impl ContractManager {
    /// Create a brand-new contract with the host in `params`.
    pub async fn contract_create_negotiate(
        &self,
        params: &ContractParams,
    ) -> Result<ContractHeader, NegotiationError> {
        let uc = UnlockConditions::new(params.client_payment_address, params.host.payment_address);
        let contract = draft_storage_contract(
            &params.host,
            &params.rent_payment,
            params.funding,
            params.start_height,
            params.end_height,
            params.client_payment_address,
            &uc,
        )?;
        let result = self
            .negotiate(params, contract, uc, ContractId::ZERO, Vec::new())
            .await;
        self.settle_host_interaction(&params.host.enode_id, &result);
        result
    }

    /// Renew an acquired contract into a successor with the same host.
    pub async fn contract_renew_negotiate(
        &self,
        old_header: &ContractHeader,
        old_roots: Vec<B256>,
        params: &ContractParams,
    ) -> Result<ContractHeader, NegotiationError> {
        let last_revision = &old_header.latest_revision;
        let contract = draft_renewed_contract(
            &params.host,
            &params.rent_payment,
            params.funding,
            params.start_height,
            params.end_height,
            params.client_payment_address,
            last_revision,
        )?;
        // Unlock conditions carry over from the predecessor's revision
        let uc = last_revision.unlock_conditions.clone();
        let result = self
            .negotiate(params, contract, uc, old_header.id, old_roots)
            .await;
        self.settle_host_interaction(&params.host.enode_id, &result);
        result
    }

    fn settle_host_interaction(
        &self,
        host: &common::EnodeId,
        result: &Result<ContractHeader, NegotiationError>,
    ) {
        match result {
            Ok(_) => self.host_pool.increment_successful_interactions(host),
            Err(e) if e.debits_host_score() => {
                self.host_pool.increment_failed_interactions(host)
            }
            Err(_) => {}
        }
    }

    /// Drive rounds 2 through 5 against the host.
    async fn negotiate(
        &self,
        params: &ContractParams,
        mut contract: StorageContract,
        uc: UnlockConditions,
        old_contract_id: ContractId,
        old_roots: Vec<B256>,
    ) -> Result<ContractHeader, NegotiationError> {
        let client = params.client_payment_address;
        let renew = !old_contract_id.is_zero();

        // Both signatures are over the unsigned contract hash
        let client_sign = self.wallet.sign_digest(client, contract.rlp_hash())?;

        let mut session = self.connector.open_session(&params.host.enode_url).await?;
        let result = self
            .negotiate_on_session(
                session.as_mut(),
                params,
                &mut contract,
                uc,
                client_sign,
                renew,
                old_contract_id,
                old_roots,
            )
            .await;
        if let Err(e) = session.close().await {
            debug!(error = %e, "Session close after negotiation failed");
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn negotiate_on_session(
        &self,
        session: &mut dyn HostSession,
        params: &ContractParams,
        contract: &mut StorageContract,
        uc: UnlockConditions,
        client_sign: Bytes,
        renew: bool,
        old_contract_id: ContractId,
        old_roots: Vec<B256>,
    ) -> Result<ContractHeader, NegotiationError> {
        let client = params.client_payment_address;
        let contract_id = contract.id();

        // Round 2: draft + client signature, host answers with its signature
        let request = ContractCreateRequest {
            storage_contract: contract.clone(),
            sign: client_sign.clone(),
            renew,
            old_contract_id,
        };
        session
            .send_frame(Frame::encode(CONTRACT_CREATE_REQ_MSG, &request))
            .await?;
        let host_sign: Bytes =
            read_expected(session, CONTRACT_CREATE_HOST_SIGN_MSG).await?.decode()?;
        contract.signatures = vec![client_sign, host_sign];

        // Round 3: client revision signature, host answers with its own
        let mut revision = StorageContractRevision::initial(contract, uc);
        let client_revision_sign = self.wallet.sign_digest(client, revision.rlp_hash())?;
        revision.signatures = vec![client_revision_sign.clone()];
        session
            .send_frame(Frame::encode(
                CONTRACT_CREATE_CLIENT_REVISION_SIGN_MSG,
                &ContractRevisionSign {
                    revision: revision.clone(),
                    sign: client_revision_sign,
                },
            ))
            .await?;
        let host_revision_sign: Bytes =
            read_expected(session, CONTRACT_CREATE_REVISION_SIGN_MSG).await?.decode()?;
        revision.signatures.push(host_revision_sign);

        // Round 4: the contract goes on chain through the create precompile
        let args = PrecompiledTxArgs::new(
            client,
            CONTRACT_CREATE_ADDR,
            alloy_rlp::encode(&*contract),
            U256::ZERO,
            STORAGE_CONTRACT_TX_GAS,
        );
        let tx_hash =
            send_precompiled_tx(self.backend.as_ref(), self.wallet.as_ref(), &self.nonce_lock, &args)
                .await?;
        debug!(contract = %contract_id, tx = %tx_hash, renew, "Storage contract tx submitted");

        // Round 5: commit locally, acknowledge, await the host's ack
        let header = ContractHeader {
            id: contract_id,
            enode_id: params.host.enode_id,
            start_height: params.start_height,
            end_height: params.end_height,
            total_cost: params.funding,
            contract_fee: params.host.config.contract_price,
            latest_revision: revision,
            status: ContractStatus {
                upload_ability: true,
                renew_ability: true,
                canceled: false,
            },
        };
        let header = self
            .active_contracts
            .insert_contract(header, old_roots)
            .map_err(|e| NegotiationError::Commit(e.to_string()))?;

        session
            .send_frame(Frame::new(CLIENT_STOP_MSG, Bytes::new()))
            .await?;
        match read_expected(session, HOST_STOP_MSG).await {
            Ok(_) => Ok(header),
            Err(e) => {
                // The host rejected after our commit: roll the record back
                error!(contract = %contract_id, error = %e, "Host rejected contract after local commit");
                if let Some(acquired) = self.active_contracts.acquire(&contract_id).await {
                    if let Err(del) = self.active_contracts.delete(acquired) {
                        error!(contract = %contract_id, error = %del, "Rollback delete failed");
                    }
                }
                Err(e)
            }
        }
    }
}
