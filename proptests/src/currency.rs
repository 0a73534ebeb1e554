//! Currency parser round-trips.

use alloy_primitives::U256;
use proptest::prelude::*;

use common::currency::{format_currency, parse_currency};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    /// Formatting then parsing is the identity on camel amounts.
    #[test]
    fn format_parse_round_trip(raw in any::<u128>()) {
        let camel = U256::from(raw);
        let rendered = format_currency(camel);
        prop_assert_eq!(parse_currency(&rendered).unwrap(), camel);
    }

    /// Whole-dx strings scale by exactly 10^18.
    #[test]
    fn dx_scales_by_ten_to_the_eighteen(dx in 0u64..1_000_000_000) {
        let parsed = parse_currency(&format!("{dx}dx")).unwrap();
        let expected = U256::from(dx) * U256::from(10).pow(U256::from(18));
        prop_assert_eq!(parsed, expected);
    }

    /// Junk never parses.
    #[test]
    fn unknown_units_are_rejected(raw in "[0-9]{1,10}(eth|wei|btc|)") {
        prop_assert!(parse_currency(&raw).is_err());
    }
}
