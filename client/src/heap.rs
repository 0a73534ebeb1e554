//! The upload heap: priority-ordered segments awaiting repair.
//!
//! Stuck segments strictly precede unstuck ones; within the same stuck
//! class the less-complete segment wins, and equal-priority segments pop in
//! push order. Membership is deduplicated across the heap itself and the
//! set of segments already handed to workers: for any segment id at most
//! one of `{in heap, repairing}` holds, and a push while either holds is a
//! no-op.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use common::EnodeId;

use crate::file::{DxFileHandle, FileUid};

/// Identity of one segment of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegmentKey {
    pub file: FileUid,
    pub index: u64,
}

/// A repair work unit: everything a worker needs to rebuild and re-upload
/// one segment.
pub struct UnfinishedSegment {
    pub key: SegmentKey,
    pub file: Arc<DxFileHandle>,
    /// Segment index within the file
    pub index: u64,
    /// Byte offset of the segment's data within the file
    pub offset: u64,
    /// Byte length of the segment's data
    pub length: u64,
    /// Bytes of buffer memory this repair will hold
    pub memory_needed: u64,
    /// Sectors sufficient to reconstruct the segment
    pub minimum_sectors: usize,
    /// Sectors the segment wants in total
    pub sectors_need_num: usize,
    /// Sectors already on good hosts
    pub sectors_completed_num: usize,
    pub stuck: bool,
    /// Set when this unit came through the random stuck-repair path
    pub stuck_repair: bool,
    /// Which sector slots are already filled
    pub sector_slots_status: Vec<bool>,
    /// Hosts not yet carrying any sector of this segment
    pub unused_hosts: HashSet<EnodeId>,
    /// Reconstructed sector buffers, filled during the repair
    pub physical_segment_data: Vec<Option<Vec<u8>>>,
}

impl UnfinishedSegment {
    /// Fraction of wanted sectors already in place.
    pub fn completion(&self) -> f64 {
        self.sectors_completed_num as f64 / self.sectors_need_num.max(1) as f64
    }
}

struct HeapEntry {
    stuck: bool,
    completed: usize,
    need: usize,
    seq: u64,
    segment: UnfinishedSegment,
}

impl HeapEntry {
    /// Whether `self` is more urgent than `other`.
    fn more_urgent(&self, other: &Self) -> Ordering {
        if self.stuck != other.stuck {
            return if self.stuck {
                Ordering::Greater
            } else {
                Ordering::Less
            };
        }
        // Compare completion ratios by cross-multiplication; less complete
        // is more urgent
        let lhs = self.completed as u128 * other.need.max(1) as u128;
        let rhs = other.completed as u128 * self.need.max(1) as u128;
        match lhs.cmp(&rhs) {
            Ordering::Less => Ordering::Greater,
            Ordering::Greater => Ordering::Less,
            // FIFO within equal priority
            Ordering::Equal => other.seq.cmp(&self.seq),
        }
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.more_urgent(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.more_urgent(other)
    }
}

#[derive(Default)]
struct HeapInner {
    heap: BinaryHeap<HeapEntry>,
    heap_segments: HashSet<SegmentKey>,
    repairing_segments: HashSet<SegmentKey>,
    seq: u64,
}

/// The priority queue feeding the repair workers, plus the signals the
/// repair loop blocks on.
#[derive(Default)]
pub struct UploadHeap {
    inner: Mutex<HeapInner>,
    /// Signaled when new user uploads arrive
    pub new_uploads: Notify,
    /// Signaled when the health loop finds files needing repair
    pub repair_needed: Notify,
    /// Signaled when a stuck segment is discovered
    pub stuck_segment_found: Notify,
}

impl UploadHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    /// Push a segment unless it is already queued or being repaired.
    /// Returns whether the segment was added.
    pub fn push(&self, segment: UnfinishedSegment) -> bool {
        let mut inner = self.inner.lock();
        if inner.heap_segments.contains(&segment.key)
            || inner.repairing_segments.contains(&segment.key)
        {
            return false;
        }
        inner.heap_segments.insert(segment.key);
        let seq = inner.seq;
        inner.seq += 1;
        inner.heap.push(HeapEntry {
            stuck: segment.stuck,
            completed: segment.sectors_completed_num,
            need: segment.sectors_need_num,
            seq,
            segment,
        });
        true
    }

    /// Pop the most urgent segment.
    pub fn pop(&self) -> Option<UnfinishedSegment> {
        let mut inner = self.inner.lock();
        let entry = inner.heap.pop()?;
        inner.heap_segments.remove(&entry.segment.key);
        Some(entry.segment)
    }

    /// Move a popped segment into the repairing set before dispatch.
    pub fn mark_repairing(&self, key: SegmentKey) {
        self.inner.lock().repairing_segments.insert(key);
    }

    /// Release a segment from the repairing set once workers are done with
    /// it (successfully or not).
    pub fn finish_repair(&self, key: &SegmentKey) {
        self.inner.lock().repairing_segments.remove(key);
    }

    pub fn is_repairing(&self, key: &SegmentKey) -> bool {
        self.inner.lock().repairing_segments.contains(key)
    }

    pub fn contains(&self, key: &SegmentKey) -> bool {
        let inner = self.inner.lock();
        inner.heap_segments.contains(key) || inner.repairing_segments.contains(key)
    }
}
