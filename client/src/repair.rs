//! The repair scheduler: from file health to worker dispatch.
//!
//! The main loop waits until the chain is reachable, checks the directory
//! health signal, picks the lowest-health file, rebuilds its unstuck
//! segments into work units and feeds them through the heap to the workers.
//! The stuck loop instead repairs one random stuck segment of one random
//! file per wake-up.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use common::EnodeId;

use crate::file::{
    DxFileHandle, COMPLETE_HEALTH_THRESHOLD, REPAIR_HEALTH_THRESHOLD, UNSTUCK_HEALTH_THRESHOLD,
};
use crate::heap::{SegmentKey, UnfinishedSegment};
use crate::worker::SegmentDispatch;
use crate::StorageClient;

/// What kind of segments a heap-building pass targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairTarget {
    StuckSegments,
    UnstuckSegments,
}

impl StorageClient {
    /// Refresh the worker pool from the live contract set and collect the
    /// hosts currently under contract.
    pub(crate) fn refresh_hosts_and_workers(&self) -> HashSet<EnodeId> {
        let contracts = self.contract_manager.contracts();
        self.worker_pool.activate(&contracts);
        contracts.iter().map(|c| c.enode_id).collect()
    }

    /// Build the unfinished work units for one file.
    ///
    /// Returns only segments that are incomplete and worth repairing; as a
    /// side effect, segments discovered to be unrepairable are marked stuck
    /// and healthy-complete ones unstuck.
    pub(crate) fn create_unfinished_segments(
        &self,
        file: &Arc<DxFileHandle>,
        hosts: &HashSet<EnodeId>,
        target: RepairTarget,
    ) -> Vec<UnfinishedSegment> {
        let utility = self.utility();

        // Without enough workers no repair can reconstruct anything; park
        // everything unhealthy as stuck and bail
        let min_sectors = file.meta.read().erasure.min_sectors;
        if self.worker_pool.len() < min_sectors {
            debug!(
                workers = self.worker_pool.len(),
                min_sectors, "Not enough workers, marking unhealthy segments stuck"
            );
            file.meta.write().mark_all_unhealthy_segments_stuck(utility);
            return Vec::new();
        }

        let meta = file.meta.read().clone();
        let want_stuck = target == RepairTarget::StuckSegments;
        let indexes: Vec<usize> = meta
            .segments
            .iter()
            .enumerate()
            .filter(|(_, segment)| segment.stuck == want_stuck)
            .map(|(index, _)| index)
            .collect();
        if indexes.is_empty() {
            return Vec::new();
        }

        let erasure = meta.erasure;
        let mut candidates = Vec::with_capacity(indexes.len());
        for index in indexes {
            let mut segment = UnfinishedSegment {
                key: SegmentKey {
                    file: meta.uid,
                    index: index as u64,
                },
                file: file.clone(),
                index: index as u64,
                offset: index as u64 * erasure.segment_size(),
                length: erasure.segment_size(),
                memory_needed: erasure.sector_size
                    * (erasure.num_sectors + erasure.min_sectors) as u64
                    + erasure.num_sectors as u64 * meta.cipher_overhead,
                minimum_sectors: erasure.min_sectors,
                sectors_need_num: erasure.num_sectors,
                sectors_completed_num: 0,
                stuck: meta.segments[index].stuck,
                stuck_repair: false,
                sector_slots_status: vec![false; erasure.num_sectors],
                unused_hosts: hosts.clone(),
                physical_segment_data: vec![None; erasure.num_sectors],
            };

            // Walk the persisted sector table and mark the slots already
            // held by hosts whose contracts remain good for renewal
            for (sector_index, replicas) in meta.segments[index].sectors.iter().enumerate() {
                for replica in replicas {
                    let good = utility
                        .contract_utility(&replica.host)
                        .map(|u| u.good_for_renew)
                        .unwrap_or(false);
                    if !good {
                        continue;
                    }
                    let unused = segment.unused_hosts.contains(&replica.host);
                    let redundant = segment.sector_slots_status[sector_index];
                    if unused && !redundant {
                        segment.sector_slots_status[sector_index] = true;
                        segment.sectors_completed_num += 1;
                        segment.unused_hosts.remove(&replica.host);
                    } else if unused {
                        segment.unused_hosts.remove(&replica.host);
                    }
                }
            }
            candidates.push(segment);
        }

        // Keep only segments that are incomplete and repairable; settle the
        // stuck flags of everything else
        let mut incomplete_segments = Vec::new();
        for segment in candidates {
            let index = segment.index as usize;
            let incomplete = segment.sectors_completed_num < segment.sectors_need_num;
            let health = meta.segment_health(index, utility);
            let downloadable =
                health >= UNSTUCK_HEALTH_THRESHOLD || meta.local_source_available();
            let imperfect = !incomplete && health != COMPLETE_HEALTH_THRESHOLD;

            if incomplete && (downloadable || want_stuck) {
                incomplete_segments.push(segment);
                continue;
            }
            if !downloadable {
                info!(segment = ?segment.key, "Marking segment stuck: not downloadable");
                file.meta.write().set_stuck(index, true);
            } else if imperfect {
                info!(
                    segment = ?segment.key,
                    health, "Marking segment stuck: complete but imperfect health"
                );
                file.meta.write().set_stuck(index, true);
            } else {
                // Complete and healthy
                file.meta.write().set_stuck(index, false);
            }
        }
        incomplete_segments
    }

    /// Build and push every eligible segment of the given files.
    pub(crate) fn create_and_push_segments(
        &self,
        files: &[Arc<DxFileHandle>],
        hosts: &HashSet<EnodeId>,
        target: RepairTarget,
    ) {
        for file in files {
            let segments = self.create_unfinished_segments(file, hosts, target);
            for segment in segments {
                self.upload_heap.push(segment);
            }
        }
    }

    /// Pick one random file and one random eligible segment of it. Keeps one
    /// always-broken file from monopolizing the stuck-repair path.
    pub(crate) fn create_and_push_random_segment(
        &self,
        files: &[Arc<DxFileHandle>],
        hosts: &HashSet<EnodeId>,
        target: RepairTarget,
    ) {
        if files.is_empty() {
            return;
        }
        let file = &files[rand::rng().random_range(0..files.len())];
        let mut segments = self.create_unfinished_segments(file, hosts, target);
        if segments.is_empty() {
            debug!(file = %file.uid(), "No stuck segments to push for random repair");
            return;
        }
        let mut segment = segments.swap_remove(rand::rng().random_range(0..segments.len()));
        segment.stuck_repair = true;
        self.upload_heap.push(segment);
    }

    /// Select the files a heap-building pass should consider.
    pub(crate) fn files_for_target(&self, target: RepairTarget) -> Vec<Arc<DxFileHandle>> {
        let now = common::now_secs();
        self.file_set
            .all()
            .into_iter()
            .filter(|file| {
                let meta = file.meta.read();
                match target {
                    RepairTarget::StuckSegments => meta.num_stuck_segments() > 0,
                    RepairTarget::UnstuckSegments => {
                        // Rest recently repaired files and skip all-stuck ones
                        now.saturating_sub(meta.time_recent_repair)
                            >= self.config.file_repair_interval_secs
                            && meta.num_stuck_segments() < meta.num_segments()
                    }
                }
            })
            .collect()
    }

    /// Reserve memory for the segment and hand it to the workers.
    ///
    /// Blocks until the memory budget admits the segment; stuck repairs take
    /// the priority lane.
    pub(crate) async fn do_prepare_next_segment(&self, segment: UnfinishedSegment) -> bool {
        let key = segment.key;
        let granted = tokio::select! {
            _ = self.cancel.cancelled() => false,
            granted = self.memory.request(segment.memory_needed, segment.stuck_repair) => granted,
        };
        if !granted {
            warn!(segment = ?key, "Could not obtain repair memory");
            segment
                .file
                .meta
                .write()
                .set_stuck(segment.index as usize, true);
            return false;
        }
        self.upload_heap.mark_repairing(key);
        SegmentDispatch::dispatch(
            &self.worker_pool,
            self.upload_heap.clone(),
            self.memory.clone(),
            segment,
        );
        true
    }

    /// Work through the heap until it empties, the rebuild timer fires, or
    /// enough consecutive dispatches have gone out.
    pub(crate) async fn upload_loop(&self) {
        let mut consecutive_uploads = 0usize;
        let rebuild_deadline = tokio::time::Instant::now() + self.config.rebuild_heap_interval;

        loop {
            if self.cancel.is_cancelled() || tokio::time::Instant::now() >= rebuild_deadline {
                return;
            }
            if !self.online() {
                return;
            }
            let Some(segment) = self.upload_heap.pop() else {
                return;
            };

            // A shrunken worker pool can no longer carry this segment
            if self.worker_pool.len() < segment.minimum_sectors {
                debug!(segment = ?segment.key, "Marking segment stuck: not enough workers");
                segment
                    .file
                    .meta
                    .write()
                    .set_stuck(segment.index as usize, true);
                self.upload_heap.stuck_segment_found.notify_one();
                continue;
            }

            if !self.do_prepare_next_segment(segment).await {
                continue;
            }
            consecutive_uploads += 1;

            if consecutive_uploads >= self.config.max_consecutive_segment_uploads {
                // Yield to the scheduler; only stuck segments keep their
                // place in the queue
                let mut stuck_segments = Vec::new();
                while let Some(segment) = self.upload_heap.pop() {
                    if segment.stuck {
                        stuck_segments.push(segment);
                    }
                }
                for segment in stuck_segments {
                    self.upload_heap.push(segment);
                }
                return;
            }
        }
    }

    /// One repair iteration: pick the worst file, queue its segments, run
    /// the upload loop, refresh the health signal.
    pub(crate) async fn do_upload_and_repair(&self) -> anyhow::Result<()> {
        let Some(file) = self.file_set.select_file_to_fix(self.utility()) else {
            debug!("No file in need of repair");
            return Ok(());
        };

        let hosts = self.refresh_hosts_and_workers();
        let before = self.upload_heap.len();
        self.create_and_push_segments(
            std::slice::from_ref(&file),
            &hosts,
            RepairTarget::UnstuckSegments,
        );
        let queued = self.upload_heap.len().saturating_sub(before);
        if queued == 0 {
            debug!(file = %file.uid(), "No segments queued for repair");
            self.file_set.update_metadata(self.utility());
            return Ok(());
        }

        info!(file = %file.uid(), segments = queued, "Repairing segments");
        self.upload_loop().await;

        // Propagate the new health signal upward
        self.file_set.update_metadata(self.utility());
        Ok(())
    }

    /// Block until the chain backend is reachable and synced. Returns false
    /// on cancellation.
    pub(crate) async fn wait_online(&self) -> bool {
        loop {
            if self.online() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.online_check_interval) => {}
            }
        }
    }

    /// The main repair loop.
    pub(crate) async fn upload_and_repair_loop(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            if !self.wait_online().await {
                return;
            }

            let metadata = self.file_set.update_metadata(self.utility());
            if metadata.health >= REPAIR_HEALTH_THRESHOLD {
                // Healthy enough; sleep until something needs us
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = self.upload_heap.new_uploads.notified() => {}
                    _ = self.upload_heap.repair_needed.notified() => {}
                }
                continue;
            }

            if let Err(e) = self.do_upload_and_repair().await {
                warn!(error = %e, "Upload and repair iteration failed");
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.config.repair_error_sleep) => {}
                }
            }

            // Let other tasks breathe between iterations
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// The stuck-segment repair loop: one random stuck segment per wake-up.
    pub(crate) async fn stuck_repair_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.upload_heap.stuck_segment_found.notified() => {}
            }
            if !self.wait_online().await {
                return;
            }

            let hosts = self.refresh_hosts_and_workers();
            let files = self.files_for_target(RepairTarget::StuckSegments);
            self.create_and_push_random_segment(&files, &hosts, RepairTarget::StuckSegments);
            self.upload_loop().await;
            self.file_set.update_metadata(self.utility());
        }
    }
}
