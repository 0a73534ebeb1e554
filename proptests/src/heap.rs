//! Upload-heap ordering and membership invariants.

use std::collections::HashSet;

use proptest::prelude::*;

use storage_client::{
    DxFile, DxFileHandle, ErasureParams, FileUid, SegmentKey, UnfinishedSegment, UploadHeap,
};

use crate::strategies::segment_priority;

fn segment(uid: u64, stuck: bool, completed: usize, need: usize) -> UnfinishedSegment {
    let mut uid_bytes = [0u8; 16];
    uid_bytes[..8].copy_from_slice(&uid.to_be_bytes());
    let file = DxFileHandle::new(DxFile::new(
        FileUid(uid_bytes),
        format!("/prop/{uid}"),
        None,
        ErasureParams {
            min_sectors: 1,
            num_sectors: need.max(1),
            sector_size: 64,
        },
        0,
        1,
    ));
    UnfinishedSegment {
        key: SegmentKey {
            file: FileUid(uid_bytes),
            index: 0,
        },
        file,
        index: 0,
        offset: 0,
        length: 64,
        memory_needed: 64,
        minimum_sectors: 1,
        sectors_need_num: need,
        sectors_completed_num: completed,
        stuck,
        stuck_repair: false,
        sector_slots_status: vec![false; need],
        unused_hosts: HashSet::new(),
        physical_segment_data: Vec::new(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Popping drains segments stuck-first, least-complete-first within a
    /// stuck class.
    #[test]
    fn pop_order_is_monotone(priorities in prop::collection::vec(segment_priority(), 1..32)) {
        let heap = UploadHeap::new();
        for (i, (stuck, completed, need)) in priorities.iter().enumerate() {
            prop_assert!(heap.push(segment(i as u64, *stuck, *completed, *need)));
        }

        let mut popped = Vec::new();
        while let Some(seg) = heap.pop() {
            popped.push((seg.stuck, seg.completion()));
        }
        prop_assert_eq!(popped.len(), priorities.len());

        for window in popped.windows(2) {
            let (stuck_a, ratio_a) = window[0];
            let (stuck_b, ratio_b) = window[1];
            // Stuck never follows unstuck
            prop_assert!(stuck_a || !stuck_b, "unstuck popped before stuck");
            if stuck_a == stuck_b {
                prop_assert!(ratio_a <= ratio_b + 1e-9, "completion order violated");
            }
        }
    }

    /// A segment id is in at most one of the heap and the repairing set, and
    /// re-pushes while present are rejected.
    #[test]
    fn membership_is_exclusive(ops in prop::collection::vec(0u8..4, 1..64)) {
        let heap = UploadHeap::new();
        let mut uid_bytes = [0u8; 16];
        uid_bytes[..8].copy_from_slice(&0x0707070707070707u64.to_be_bytes());
        let key = SegmentKey { file: FileUid(uid_bytes), index: 0 };
        let mut in_heap = false;
        let mut repairing = false;

        for op in ops {
            match op {
                0 => {
                    let accepted = heap.push(segment(0x0707070707070707, false, 0, 4));
                    prop_assert_eq!(accepted, !(in_heap || repairing));
                    in_heap = in_heap || accepted;
                }
                1 => {
                    let popped = heap.pop().is_some();
                    prop_assert_eq!(popped, in_heap);
                    in_heap = false;
                }
                2 => {
                    if !in_heap {
                        heap.mark_repairing(key);
                        repairing = true;
                    }
                }
                _ => {
                    heap.finish_repair(&key);
                    repairing = false;
                }
            }
            // The two sets never both hold the key
            prop_assert!(!(in_heap && repairing));
            prop_assert_eq!(heap.contains(&key), in_heap || repairing);
        }
    }
}
