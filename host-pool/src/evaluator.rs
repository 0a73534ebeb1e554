//! Host scoring.
//!
//! The pool ranks hosts with a pluggable [`HostEvaluator`]; the default one
//! multiplies independent factors in [0, 1] (age, collateral, interaction
//! history, price against the rent budget, remaining capacity, uptime)
//! onto a fixed base score. Scores feed the weighted selection in the tree,
//! so a factor of 0.5 literally halves a host's chance of being picked.

use alloy_primitives::U256;

use common::{HostInfo, RentPayment, BLOCKS_PER_DAY, BLOCKS_PER_WEEK};

/// Base score every factor multiplies into.
pub const BASE_SCORE: f64 = 1e12;

/// Per-factor breakdown of a host's score.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationDetail {
    pub age_factor: f64,
    pub deposit_factor: f64,
    pub interaction_factor: f64,
    pub price_factor: f64,
    pub storage_remaining_factor: f64,
    pub uptime_factor: f64,
    pub evaluation: u64,
}

/// Pluggable host scorer.
pub trait HostEvaluator: Send + Sync {
    fn evaluate_detail(&self, info: &HostInfo, block_height: u64) -> EvaluationDetail;

    fn evaluate(&self, info: &HostInfo, block_height: u64) -> u64 {
        self.evaluate_detail(info, block_height).evaluation
    }
}

/// The standard evaluator, parameterized by the client's rent budget.
#[derive(Debug, Clone)]
pub struct DefaultEvaluator {
    rent: RentPayment,
}

impl DefaultEvaluator {
    pub fn new(rent: RentPayment) -> Self {
        Self { rent }
    }

    /// Young hosts get a reduced score until they have a track record.
    fn age_factor(&self, info: &HostInfo, block_height: u64) -> f64 {
        let age = block_height.saturating_sub(info.first_seen);
        if age < BLOCKS_PER_DAY {
            1.0 / 3.0
        } else if age < BLOCKS_PER_WEEK {
            2.0 / 3.0
        } else {
            1.0
        }
    }

    /// Rewards collateral relative to storage price; saturates toward 1.
    fn deposit_factor(&self, info: &HostInfo) -> f64 {
        let collateral = u256_to_f64(info.config.collateral);
        let price = u256_to_f64(info.config.storage_price).max(1.0);
        collateral / (collateral + price)
    }

    /// Smoothed success ratio over all recorded interactions.
    fn interaction_factor(&self, info: &HostInfo) -> f64 {
        let successful = info.interactions.successful as f64;
        let failed = info.interactions.failed as f64;
        (successful + 0.5) / (successful + failed + 1.0)
    }

    /// Compares the host's storage price against what the rent budget can
    /// afford per byte-block.
    fn price_factor(&self, info: &HostInfo) -> f64 {
        let hosts = self.rent.storage_hosts.max(1);
        let bytes = self.rent.expected_storage.max(1) / hosts;
        let denominator = U256::from(bytes) * U256::from(self.rent.period.max(1));
        let budget_per_byte_block = u256_to_f64(self.rent.fund / denominator);
        let price = u256_to_f64(info.config.storage_price);
        if budget_per_byte_block <= 0.0 {
            return 0.5;
        }
        budget_per_byte_block / (budget_per_byte_block + price)
    }

    /// Whether the host can actually hold this client's expected share.
    fn storage_remaining_factor(&self, info: &HostInfo) -> f64 {
        let hosts = self.rent.storage_hosts.max(1);
        let wanted = (self.rent.expected_storage / hosts).max(1);
        let remaining = info.config.remaining_storage;
        (remaining as f64 / wanted as f64).min(1.0)
    }

    /// Downtime hurts quadratically.
    fn uptime_factor(&self, info: &HostInfo) -> f64 {
        let rate = info.up_rate();
        rate * rate
    }
}

impl HostEvaluator for DefaultEvaluator {
    fn evaluate_detail(&self, info: &HostInfo, block_height: u64) -> EvaluationDetail {
        let age_factor = self.age_factor(info, block_height);
        let deposit_factor = self.deposit_factor(info);
        let interaction_factor = self.interaction_factor(info);
        let price_factor = self.price_factor(info);
        let storage_remaining_factor = self.storage_remaining_factor(info);
        let uptime_factor = self.uptime_factor(info);

        let score = BASE_SCORE
            * age_factor
            * deposit_factor
            * interaction_factor
            * price_factor
            * storage_remaining_factor
            * uptime_factor;

        EvaluationDetail {
            age_factor,
            deposit_factor,
            interaction_factor,
            price_factor,
            storage_remaining_factor,
            uptime_factor,
            // Every host keeps a nonzero chance of being picked
            evaluation: (score as u64).max(1),
        }
    }
}

/// Lossy conversion for scoring purposes only.
pub(crate) fn u256_to_f64(value: U256) -> f64 {
    value
        .as_limbs()
        .iter()
        .enumerate()
        .map(|(i, limb)| *limb as f64 * 2f64.powi(64 * i as i32))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{HostConfig, ScanRecord};

    fn capable_host() -> HostInfo {
        HostInfo {
            config: HostConfig {
                storage_price: U256::from(100u64),
                collateral: U256::from(200u64),
                remaining_storage: u64::MAX / 2,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn older_hosts_score_higher() {
        let evaluator = DefaultEvaluator::new(RentPayment::default());
        let mut young = capable_host();
        young.first_seen = 100;
        let old = capable_host();
        let at = BLOCKS_PER_WEEK + 50;
        assert!(evaluator.evaluate(&old, at) > evaluator.evaluate(&young, at));
    }

    #[test]
    fn downtime_debits_the_score() {
        let evaluator = DefaultEvaluator::new(RentPayment::default());
        let mut flaky = capable_host();
        flaky.historical_uptime = 50;
        flaky.historical_downtime = 50;
        let steady = capable_host();
        assert!(evaluator.evaluate(&steady, 0) > evaluator.evaluate(&flaky, 0));
    }

    #[test]
    fn failed_interactions_debit_the_score() {
        let evaluator = DefaultEvaluator::new(RentPayment::default());
        let mut bad = capable_host();
        bad.interactions.record(false, true);
        bad.interactions.record(false, true);
        let mut good = capable_host();
        good.interactions.record(true, true);
        assert!(evaluator.evaluate(&good, 0) > evaluator.evaluate(&bad, 0));
    }

    #[test]
    fn expensive_hosts_score_lower() {
        let evaluator = DefaultEvaluator::new(RentPayment::default());
        let cheap = capable_host();
        let mut dear = capable_host();
        dear.config.storage_price = U256::from(1_000_000_000u64);
        assert!(evaluator.evaluate(&cheap, 0) > evaluator.evaluate(&dear, 0));
    }

    #[test]
    fn evaluation_is_always_positive() {
        let evaluator = DefaultEvaluator::new(RentPayment::default());
        let mut hopeless = HostInfo::default();
        hopeless.historical_downtime = 1000;
        hopeless.push_scan_record(ScanRecord {
            timestamp: 0,
            success: false,
        });
        assert!(evaluator.evaluate(&hopeless, 0) >= 1);
    }
}
