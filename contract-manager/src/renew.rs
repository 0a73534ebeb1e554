//! Renewal classification and execution.
//!
//! Every maintenance tick the active set is swept into two buckets:
//! contracts about to expire (the renew window has opened) and contracts
//! whose client balance is running dry. Close-to-expire renewals run first;
//! each renewal is budget-gated against the client's remaining fund and
//! holds the per-contract lock for its whole duration.

use alloy_primitives::U256;
use anyhow::{anyhow, Context};
use tracing::{error, info, warn};

use common::{ContractId, ContractStatus, HostInfo, RentPayment, SECTOR_SIZE};

use crate::contract_set::{AcquiredContract, ContractHeader};
use crate::negotiate::ContractParams;
use crate::ContractManager;

/// Consecutive renewal failures after which a contract is given up on and
/// replaced with a fresh host slot.
pub const CONSECUTIVE_RENEW_FAILS_BEFORE_REPLACEMENT: u64 = 3;

/// Safety margin applied on top of the renewal cost estimate, in percent.
pub const EXTRA_RATIO_PERCENT: u64 = 2;

/// A contract's balance must stay above this fraction of its total cost
/// (1/20 = 5%) or it is renewed for funding.
pub const MIN_PAYMENT_RATIO_DENOMINATOR: u64 = 20;

/// One renewal to perform and the funding earmarked for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenewRecord {
    pub id: ContractId,
    pub cost: U256,
}

/// Cost of keeping one sector with this host for a full period: storage for
/// the period plus one upload and one download of the sector.
pub fn sector_unit_cost(host: &HostInfo, rent: &RentPayment) -> U256 {
    let sector = U256::from(SECTOR_SIZE);
    let storage = host.config.storage_price * sector * U256::from(rent.period);
    let upload = host.config.upload_bandwidth_price * sector;
    let download = host.config.download_bandwidth_price * sector;
    storage + upload + download
}

/// Estimate what renewing this contract will cost for another period,
/// with a margin of [`EXTRA_RATIO_PERCENT`].
pub fn renew_cost_estimation(host: &HostInfo, contract: &ContractHeader, rent: &RentPayment) -> U256 {
    let hosts = rent.storage_hosts.max(1);
    let stored_bytes =
        ((rent.expected_storage / hosts) as f64 * rent.expected_redundancy) as u64;
    let storage_cost =
        host.config.storage_price * U256::from(stored_bytes) * U256::from(rent.period);
    let upload_cost = host.config.upload_bandwidth_price * U256::from(rent.expected_upload / hosts);
    let download_cost =
        host.config.download_bandwidth_price * U256::from(rent.expected_download / hosts);

    let base = storage_cost + upload_cost + download_cost + contract.contract_fee;
    base + base * U256::from(EXTRA_RATIO_PERCENT) / U256::from(100u64)
}

impl ContractManager {
    /// Sweep the active set into the two renewal buckets.
    ///
    /// Contracts whose host is missing or filtered are skipped, as are
    /// contracts already marked not-renewable.
    pub fn check_for_contract_renew(&self) -> (Vec<RenewRecord>, Vec<RenewRecord>) {
        let (current_height, rent) = {
            let state = self.state.read();
            (state.block_height, state.rent_payment.clone())
        };

        let mut close_to_expire = Vec::new();
        let mut insufficient_funding = Vec::new();

        for contract in self.active_contracts.metadatas() {
            let Some(host) = self.host_pool.retrieve_host_info(&contract.enode_id) else {
                continue;
            };
            if host.filtered {
                continue;
            }
            if !contract.status.renew_ability {
                continue;
            }

            // About to expire: the renew window has opened. A renewal
            // submitted now lands in the next block at the earliest.
            let decision_height = current_height + 1;
            if decision_height + rent.renew_window >= contract.end_height {
                close_to_expire.push(RenewRecord {
                    id: contract.id,
                    cost: renew_cost_estimation(&host, &contract, &rent),
                });
                continue;
            }

            // Running dry: balance under three sector-units or under 5% of
            // the contract's total cost
            let unit = sector_unit_cost(&host, &rent);
            let balance = contract.client_balance();
            let below_unit_floor = balance < unit * U256::from(3u64);
            let below_ratio = balance * U256::from(MIN_PAYMENT_RATIO_DENOMINATOR)
                < contract.total_cost;
            if below_unit_floor || below_ratio {
                insufficient_funding.push(RenewRecord {
                    id: contract.id,
                    cost: contract.total_cost * U256::from(2u64),
                });
            }
        }

        (close_to_expire, insufficient_funding)
    }

    /// Drop failure counters for contracts no longer up for renewal.
    pub fn reset_failed_renews(
        &self,
        close_to_expire: &[RenewRecord],
        insufficient_funding: &[RenewRecord],
    ) {
        let mut state = self.state.write();
        let live: std::collections::HashSet<ContractId> = close_to_expire
            .iter()
            .chain(insufficient_funding)
            .map(|r| r.id)
            .collect();
        state.failed_renew_count.retain(|id, _| live.contains(id));
    }

    /// Execute one bucket of renewals, deducting each attempt's cost from the
    /// remaining client fund. Renewals the budget cannot cover are skipped,
    /// not failed.
    ///
    /// Returns the remaining fund and whether maintenance should terminate.
    pub(crate) async fn prepare_contract_renew(
        &self,
        records: &[RenewRecord],
        mut remaining_fund: U256,
    ) -> (U256, bool) {
        let (rent, block_height, end_height) = {
            let state = self.state.read();
            (
                state.rent_payment.clone(),
                state.block_height,
                state.current_period + state.rent_payment.period + state.rent_payment.renew_window,
            )
        };

        for record in records {
            if remaining_fund < record.cost {
                info!(
                    contract = %record.id,
                    cost = %record.cost,
                    remaining = %remaining_fund,
                    "Skipping renewal beyond the remaining client fund"
                );
                continue;
            }

            let (spent, result) = self
                .contract_renew_start(record, &rent, block_height, end_height)
                .await;
            if let Err(e) = result {
                error!(contract = %record.id, error = %e, "Contract renew failed");
            }
            remaining_fund = remaining_fund.saturating_sub(spent);

            if self.maintenance_should_stop() {
                return (remaining_fund, true);
            }
        }
        (remaining_fund, false)
    }

    /// Renew a single contract.
    ///
    /// Returns the funding actually committed (zero when nothing was spent)
    /// alongside the outcome. A renewal that succeeded on chain but failed a
    /// local status update still reports its cost with `Ok`, so the budget
    /// deduction stands and a retry cannot double-spend.
    pub(crate) async fn contract_renew_start(
        &self,
        record: &RenewRecord,
        rent: &RentPayment,
        block_height: u64,
        contract_end_height: u64,
    ) -> (U256, anyhow::Result<()>) {
        self.state.write().renewing.insert(record.id);
        let result = self
            .contract_renew_inner(record, rent, block_height, contract_end_height)
            .await;
        self.state.write().renewing.remove(&record.id);
        result
    }

    async fn contract_renew_inner(
        &self,
        record: &RenewRecord,
        rent: &RentPayment,
        block_height: u64,
        contract_end_height: u64,
    ) -> (U256, anyhow::Result<()>) {
        let Some(old_contract) = self.active_contracts.acquire(&record.id).await else {
            return (
                U256::ZERO,
                Err(anyhow!("contract {} no longer exists", record.id)),
            );
        };

        // Contract validation under the lock
        let status = old_contract.header().status;
        if !status.renew_ability {
            return (
                U256::ZERO,
                Err(anyhow!("contract {} is marked unrenewable", record.id)),
            );
        }

        let Some(host) = self.host_pool.retrieve_host_info(&old_contract.header().enode_id) else {
            return (
                U256::ZERO,
                Err(anyhow!(
                    "host of contract {} vanished from the pool",
                    record.id
                )),
            );
        };

        let params = ContractParams {
            rent_payment: rent.clone(),
            host,
            funding: record.cost,
            start_height: block_height,
            end_height: contract_end_height,
            client_payment_address: self.payment_address,
        };

        let old_header = old_contract.metadata();
        let old_roots = old_contract.merkle_roots();
        let renewed = match self
            .contract_renew_negotiate(&old_header, old_roots, &params)
            .await
        {
            Ok(renewed) => renewed,
            Err(e) => {
                let result = self.handle_renew_failed(old_contract, e.into(), rent, block_height);
                return (U256::ZERO, result);
            }
        };

        self.finish_renew(old_contract, renewed, record.cost).await
    }

    /// Commit the bookkeeping after a successful renegotiation.
    async fn finish_renew(
        &self,
        mut old_contract: AcquiredContract,
        renewed: ContractHeader,
        cost: U256,
    ) -> (U256, anyhow::Result<()>) {
        // The successor starts fully able
        let successor_status = ContractStatus {
            upload_ability: true,
            renew_ability: true,
            canceled: false,
        };
        match self.active_contracts.acquire(&renewed.id).await {
            Some(mut successor) => {
                if let Err(e) = successor.update_status(successor_status) {
                    // Renew succeeded but the status update did not; report
                    // the spend so the budget stays truthful
                    warn!(contract = %renewed.id, error = %e, "Failed to update renewed contract status");
                    return (cost, Ok(()));
                }
            }
            None => {
                warn!(contract = %renewed.id, "Renewed contract missing right after insert");
                return (cost, Ok(()));
            }
        }

        // The predecessor is spent: no uploads, no renewals, slot freed
        if let Err(e) = old_contract.update_status(ContractStatus {
            upload_ability: false,
            renew_ability: false,
            canceled: true,
        }) {
            warn!(contract = %old_contract.id(), error = %e, "Failed to update predecessor status");
        }

        let old_id = old_contract.id();
        let old_header = old_contract.metadata();
        {
            let mut state = self.state.write();
            state.renewed_from.insert(renewed.id, old_id);
            state.renewed_to.insert(old_id, renewed.id);
            state.expired_contracts.insert(old_id, old_header);
        }

        if let Err(e) = self.save_settings() {
            warn!(error = %e, "Failed to persist settings after contract renew");
        }

        if let Err(e) = self.active_contracts.delete(old_contract) {
            warn!(contract = %old_id, error = %e, "Failed to delete predecessor from active set");
        }

        info!(old = %old_id, new = %renewed.id, "Contract renewed");
        (cost, Ok(()))
    }

    /// Failure handling: count the failure, and once the contract is deep in
    /// its renew window with too many consecutive failures, cancel it so its
    /// host slot can be refilled.
    fn handle_renew_failed(
        &self,
        mut failed_contract: AcquiredContract,
        renew_error: anyhow::Error,
        rent: &RentPayment,
        block_height: u64,
    ) -> anyhow::Result<()> {
        let id = failed_contract.id();
        let failures = {
            let mut state = self.state.write();
            let count = state.failed_renew_count.entry(id).or_insert(0);
            *count += 1;
            *count
        };

        let second_half_window =
            block_height + rent.renew_window / 2 >= failed_contract.header().end_height;
        let replace = failures >= CONSECUTIVE_RENEW_FAILS_BEFORE_REPLACEMENT;

        if second_half_window && replace {
            let mut status = failed_contract.header().status;
            status.upload_ability = false;
            status.renew_ability = false;
            status.canceled = true;
            failed_contract
                .update_status(status)
                .context("marking failed contract canceled")?;
            return Err(anyhow!(
                "contract {id} canceled after {failures} consecutive renew failures: {renew_error}"
            ));
        }

        Err(renew_error.context("contract renew failed, will retry next tick"))
    }
}
