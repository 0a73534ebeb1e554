//! File metadata: erasure-coded segments and their sector placements.
//!
//! A logical file is split into segments, each erasure-coded into
//! `num_sectors` sectors of which any `min_sectors` reconstruct the data.
//! Every sector targets a distinct host; the per-segment table records which
//! hosts hold which sector. Health is judged against the contracts backing
//! those hosts: a sector only counts while its host's contract is good for
//! renewal.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use alloy_primitives::B256;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use common::{now_secs, ContractUtilitySource, EnodeId};

/// A segment at or above this health needs no repair.
pub const REPAIR_HEALTH_THRESHOLD: f64 = 0.8;

/// A segment below this health cannot be rebuilt from its remote sectors.
pub const UNSTUCK_HEALTH_THRESHOLD: f64 = 0.25;

/// Health of a fully redundant segment.
pub const COMPLETE_HEALTH_THRESHOLD: f64 = 1.0;

/// Identity of a logical file, stable across renames.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct FileUid(pub [u8; 16]);

impl fmt::Display for FileUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for FileUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileUid({})", hex::encode(self.0))
    }
}

/// Erasure-coding shape of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureParams {
    /// Sectors sufficient to reconstruct a segment
    pub min_sectors: usize,
    /// Sectors produced per segment
    pub num_sectors: usize,
    /// Bytes per sector
    pub sector_size: u64,
}

impl ErasureParams {
    /// Usable bytes per segment (the data portion).
    pub fn segment_size(&self) -> u64 {
        self.min_sectors as u64 * self.sector_size
    }
}

/// One sector replica: which host holds it and under which merkle root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorRef {
    pub host: EnodeId,
    pub root: B256,
}

/// Persisted per-segment state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub stuck: bool,
    pub last_health_check: u64,
    /// `sectors[sector_index]` lists every replica of that sector
    pub sectors: Vec<Vec<SectorRef>>,
}

/// Metadata of one erasure-coded file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DxFile {
    pub uid: FileUid,
    /// Logical path inside the client's namespace
    pub dx_path: String,
    /// Source file on the local disk, while it still exists
    pub local_path: Option<PathBuf>,
    pub erasure: ErasureParams,
    /// Extra bytes per sector added by the cipher
    pub cipher_overhead: u64,
    pub segments: Vec<SegmentMeta>,
    /// Unix timestamp of the last completed repair pass over this file
    pub time_recent_repair: u64,
}

impl DxFile {
    /// A fresh file with `segment_count` empty segments.
    pub fn new(
        uid: FileUid,
        dx_path: impl Into<String>,
        local_path: Option<PathBuf>,
        erasure: ErasureParams,
        cipher_overhead: u64,
        segment_count: usize,
    ) -> Self {
        let segments = (0..segment_count)
            .map(|_| SegmentMeta {
                stuck: false,
                last_health_check: 0,
                sectors: vec![Vec::new(); erasure.num_sectors],
            })
            .collect();
        Self {
            uid,
            dx_path: dx_path.into(),
            local_path,
            erasure,
            cipher_overhead,
            segments,
            time_recent_repair: 0,
        }
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn num_stuck_segments(&self) -> usize {
        self.segments.iter().filter(|s| s.stuck).count()
    }

    /// Whether the original source data is still on the local disk.
    pub fn local_source_available(&self) -> bool {
        self.local_path
            .as_ref()
            .map(|p| p.exists())
            .unwrap_or(false)
    }

    /// Count of sector slots backed by at least one host whose contract is
    /// good for renewal.
    pub fn good_sectors(&self, index: usize, utility: &dyn ContractUtilitySource) -> usize {
        self.segments[index]
            .sectors
            .iter()
            .filter(|replicas| {
                replicas.iter().any(|r| {
                    utility
                        .contract_utility(&r.host)
                        .map(|u| u.good_for_renew)
                        .unwrap_or(false)
                })
            })
            .count()
    }

    /// Health of one segment in [0, 1]: the usable redundancy above the
    /// reconstruction minimum.
    pub fn segment_health(&self, index: usize, utility: &dyn ContractUtilitySource) -> f64 {
        let good = self.good_sectors(index, utility) as f64;
        let min = self.erasure.min_sectors as f64;
        let num = self.erasure.num_sectors as f64;
        if num <= min {
            return if good >= num { 1.0 } else { 0.0 };
        }
        ((good - min) / (num - min)).clamp(0.0, 1.0)
    }

    /// Worst segment health across the file; an empty file is perfect.
    pub fn health(&self, utility: &dyn ContractUtilitySource) -> f64 {
        (0..self.segments.len())
            .map(|i| self.segment_health(i, utility))
            .fold(1.0, f64::min)
    }

    pub fn set_stuck(&mut self, index: usize, stuck: bool) {
        self.segments[index].stuck = stuck;
        self.segments[index].last_health_check = now_secs();
    }

    /// Mark every segment whose health is below the repair threshold stuck.
    /// Used when the worker pool cannot carry a repair at all.
    pub fn mark_all_unhealthy_segments_stuck(&mut self, utility: &dyn ContractUtilitySource) {
        for index in 0..self.segments.len() {
            if self.segment_health(index, utility) < REPAIR_HEALTH_THRESHOLD {
                self.set_stuck(index, true);
            }
        }
    }

    /// Record a freshly uploaded sector replica.
    pub fn add_sector(&mut self, segment: usize, sector: usize, replica: SectorRef) {
        let replicas = &mut self.segments[segment].sectors[sector];
        if !replicas.contains(&replica) {
            replicas.push(replica);
        }
    }
}

/// A shared, mutable file record.
pub struct DxFileHandle {
    pub meta: RwLock<DxFile>,
}

impl DxFileHandle {
    pub fn new(file: DxFile) -> Arc<Self> {
        Arc::new(Self {
            meta: RwLock::new(file),
        })
    }

    pub fn uid(&self) -> FileUid {
        self.meta.read().uid
    }
}

/// Aggregated directory metadata: the health signal driving the repair loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirMetadata {
    /// Worst file health in the set
    pub health: f64,
    pub num_files: usize,
    pub num_stuck_segments: usize,
}

impl Default for DirMetadata {
    fn default() -> Self {
        Self {
            health: 1.0,
            num_files: 0,
            num_stuck_segments: 0,
        }
    }
}

/// The client's registry of files.
#[derive(Default)]
pub struct FileSet {
    files: DashMap<FileUid, Arc<DxFileHandle>>,
    metadata: RwLock<DirMetadata>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, file: DxFile) -> Arc<DxFileHandle> {
        let handle = DxFileHandle::new(file);
        self.files.insert(handle.uid(), handle.clone());
        handle
    }

    pub fn remove(&self, uid: &FileUid) -> Option<Arc<DxFileHandle>> {
        self.files.remove(uid).map(|(_, handle)| handle)
    }

    pub fn get(&self, uid: &FileUid) -> Option<Arc<DxFileHandle>> {
        self.files.get(uid).map(|entry| entry.clone())
    }

    pub fn all(&self) -> Vec<Arc<DxFileHandle>> {
        self.files.iter().map(|entry| entry.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// The lowest-health file with at least one unstuck segment, i.e. the
    /// next file the repair loop should work on.
    pub fn select_file_to_fix(
        &self,
        utility: &dyn ContractUtilitySource,
    ) -> Option<Arc<DxFileHandle>> {
        let mut worst: Option<(f64, Arc<DxFileHandle>)> = None;
        for entry in self.files.iter() {
            let meta = entry.meta.read();
            if meta.num_stuck_segments() == meta.num_segments() && meta.num_segments() > 0 {
                continue;
            }
            let health = meta.health(utility);
            drop(meta);
            match &worst {
                Some((worst_health, _)) if *worst_health <= health => {}
                _ => worst = Some((health, entry.clone())),
            }
        }
        worst.map(|(_, handle)| handle)
    }

    /// Recompute the cached directory metadata from every file.
    pub fn update_metadata(&self, utility: &dyn ContractUtilitySource) -> DirMetadata {
        let mut aggregated = DirMetadata::default();
        for entry in self.files.iter() {
            let meta = entry.meta.read();
            aggregated.num_files += 1;
            aggregated.num_stuck_segments += meta.num_stuck_segments();
            aggregated.health = aggregated.health.min(meta.health(utility));
        }
        *self.metadata.write() = aggregated;
        aggregated
    }

    /// The cached directory metadata.
    pub fn metadata(&self) -> DirMetadata {
        *self.metadata.read()
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use common::ContractUtility;
    use std::collections::HashMap;

    /// Utility source backed by a plain map.
    #[derive(Default)]
    pub(crate) struct MapUtility {
        pub entries: HashMap<EnodeId, ContractUtility>,
    }

    impl MapUtility {
        pub(crate) fn good_for(hosts: &[EnodeId]) -> Self {
            let entries = hosts
                .iter()
                .map(|h| {
                    (
                        *h,
                        ContractUtility {
                            good_for_upload: true,
                            good_for_renew: true,
                        },
                    )
                })
                .collect();
            Self { entries }
        }
    }

    impl ContractUtilitySource for MapUtility {
        fn contract_utility(&self, host: &EnodeId) -> Option<ContractUtility> {
            self.entries.get(host).copied()
        }
    }

    pub(crate) fn host(byte: u8) -> EnodeId {
        EnodeId::from_slice(&[byte; 32])
    }

    pub(crate) fn small_file(uid_byte: u8, segments: usize) -> DxFile {
        DxFile::new(
            FileUid([uid_byte; 16]),
            format!("/files/{uid_byte}"),
            None,
            ErasureParams {
                min_sectors: 2,
                num_sectors: 4,
                sector_size: 64,
            },
            0,
            segments,
        )
    }
}
