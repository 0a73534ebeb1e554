//! Host scan-record bookkeeping invariants.

use proptest::prelude::*;

use common::{HostInfo, ScanRecord, MAX_SCAN_RECORDS};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// The ring stays bounded and its success/failure counts always
    /// partition its length.
    #[test]
    fn scan_ring_is_bounded_and_partitioned(
        outcomes in prop::collection::vec(any::<bool>(), 0..(MAX_SCAN_RECORDS * 3)),
    ) {
        let mut info = HostInfo::default();
        for (i, success) in outcomes.iter().enumerate() {
            info.push_scan_record(ScanRecord {
                timestamp: i as u64,
                success: *success,
            });
            prop_assert!(info.scan_records.len() <= MAX_SCAN_RECORDS);
        }

        let successes = info.scan_records.iter().filter(|r| r.success).count();
        let failures = info.scan_records.iter().filter(|r| !r.success).count();
        prop_assert_eq!(successes + failures, info.scan_records.len());
        prop_assert_eq!(
            info.scan_records.len(),
            outcomes.len().min(MAX_SCAN_RECORDS)
        );

        // Timestamps stay in push order after evictions
        for window in info.scan_records.iter().collect::<Vec<_>>().windows(2) {
            prop_assert!(window[0].timestamp < window[1].timestamp);
        }
    }

    /// The up-rate always lands in [0, 1].
    #[test]
    fn up_rate_is_a_fraction(up in 0u64..1_000_000, down in 0u64..1_000_000) {
        let info = HostInfo {
            historical_uptime: up,
            historical_downtime: down,
            ..Default::default()
        };
        let rate = info.up_rate();
        prop_assert!((0.0..=1.0).contains(&rate));
    }
}
