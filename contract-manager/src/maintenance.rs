//! The per-block maintenance loop.
//!
//! Every block event refreshes the manager's view of the chain, advances the
//! current period when it rolls over, and runs one maintenance pass:
//! classify renewals, compact the failure counters, then execute the
//! close-to-expire bucket before the insufficient-funding bucket, all under
//! the client's remaining-fund budget.

use std::sync::Arc;

use alloy_primitives::U256;
use tracing::{debug, info, warn};

use crate::ContractManager;

/// Drives maintenance off the chain's block events until cancellation.
pub(crate) async fn maintenance_loop(manager: Arc<ContractManager>) {
    let mut blocks = manager.backend.subscribe_blocks();
    loop {
        let height = tokio::select! {
            _ = manager.cancel.cancelled() => return,
            received = blocks.recv() => match received {
                Ok(height) => height,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Maintenance missed block events, catching up");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    warn!("Block subscription closed, stopping maintenance");
                    return;
                }
            },
        };
        manager.on_block(height).await;
    }
}

impl ContractManager {
    /// Handle one block event: bookkeeping plus a maintenance pass.
    pub async fn on_block(&self, height: u64) {
        self.host_pool.set_block_height(height);
        {
            let mut state = self.state.write();
            state.block_height = height;
            // Roll the period forward when the current one has elapsed
            while height >= state.current_period + state.rent_payment.period {
                state.current_period += state.rent_payment.period;
            }
        }
        self.run_maintenance().await;
    }

    /// One full maintenance pass. Re-entrant calls collapse: a pass already
    /// in flight absorbs the new trigger.
    pub async fn run_maintenance(&self) {
        if self.maintenance_running.swap(true, std::sync::atomic::Ordering::AcqRel) {
            return;
        }
        self.maintenance_inner().await;
        self.maintenance_running
            .store(false, std::sync::atomic::Ordering::Release);
    }

    async fn maintenance_inner(&self) {
        let (close_to_expire, insufficient_funding) = self.check_for_contract_renew();
        self.reset_failed_renews(&close_to_expire, &insufficient_funding);

        if !close_to_expire.is_empty() || !insufficient_funding.is_empty() {
            info!(
                close_to_expire = close_to_expire.len(),
                insufficient_funding = insufficient_funding.len(),
                "Contract maintenance pass"
            );

            let remaining_fund = self.client_remaining_fund();

            // Expiring contracts renew first; an expired contract loses
            // data, an underfunded one merely stalls
            let (remaining_fund, terminate) = self
                .prepare_contract_renew(&close_to_expire, remaining_fund)
                .await;
            if terminate {
                return;
            }
            let (_, terminate) = self
                .prepare_contract_renew(&insufficient_funding, remaining_fund)
                .await;
            if terminate {
                return;
            }
        }

        // Refill canceled or missing host slots with fresh contracts
        if let Err(e) = self.maintain_contract_count().await {
            debug!(error = %e, "Contract formation pass did not run");
        }
    }

    /// What is left of the client's per-period fund after the contracts
    /// already formed this period.
    pub fn client_remaining_fund(&self) -> U256 {
        let (fund, current_period) = {
            let state = self.state.read();
            (state.rent_payment.fund, state.current_period)
        };
        let spent: U256 = self
            .active_contracts
            .metadatas()
            .into_iter()
            .filter(|c| c.start_height >= current_period)
            .map(|c| c.total_cost)
            .fold(U256::ZERO, |acc, cost| acc + cost);
        fund.saturating_sub(spent)
    }

    /// Whether the current maintenance pass should stop between renewals.
    pub(crate) fn maintenance_should_stop(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
