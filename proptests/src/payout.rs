//! Payout-formula properties.

use alloy_primitives::U256;
use proptest::prelude::*;

use common::{HostConfig, HostInfo};
use contract_manager::negotiate::calculate_payouts_and_host_deposit;

fn host(storage_price: u128, collateral: u128, contract_price: u128, max_collateral: u128) -> HostInfo {
    HostInfo {
        config: HostConfig {
            storage_price: U256::from(storage_price),
            collateral: U256::from(collateral),
            contract_price: U256::from(contract_price),
            max_collateral: U256::from(max_collateral),
            ..Default::default()
        },
        ..Default::default()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn payouts_respect_every_cap(
        storage_price in 0u128..1_000_000,
        collateral in 0u128..1_000_000,
        contract_price in 0u128..1_000_000,
        max_collateral in 0u128..u128::MAX / 4,
        funding in 0u128..u128::MAX / 4,
        base_price in 0u128..1_000_000_000,
        base_collateral in 0u128..1_000_000_000,
        period in 1u64..100_000,
        expected_storage in 1u64..1_000_000_000_000,
    ) {
        let host = host(storage_price, collateral, contract_price, max_collateral);
        let result = calculate_payouts_and_host_deposit(
            &host,
            U256::from(funding),
            U256::from(base_price),
            U256::from(base_collateral),
            period,
            expected_storage,
        );

        if funding <= contract_price + base_price {
            prop_assert!(result.is_err(), "underfunded drafts must be rejected");
            return Ok(());
        }

        let (client_payout, host_payout, host_collateral) = result.unwrap();

        // The client payout is exactly what funding leaves over
        prop_assert_eq!(
            client_payout + U256::from(contract_price) + U256::from(base_price),
            U256::from(funding)
        );

        // Collateral never exceeds what the host offers per contract
        prop_assert!(host_collateral <= U256::from(max_collateral));

        // Collateral never exceeds five times the client's commitment
        let cap = U256::from(collateral)
            * U256::from(period)
            * U256::from(expected_storage)
            * U256::from(5u64);
        prop_assert!(host_collateral <= cap);

        // The host payout decomposes exactly
        prop_assert_eq!(
            host_payout,
            host_collateral + U256::from(contract_price) + U256::from(base_price)
        );
    }
}
