//! The upload worker pool.
//!
//! One worker runs per live contract, keyed by the contract's host. Workers
//! receive sector jobs over a channel, push the data to their host, and
//! account the outcome back into the segment. The last job of a segment,
//! successful or not, releases the segment's memory reservation and its
//! repairing-set slot, so no path leaks either.

use std::collections::HashMap;
use std::sync::Arc;

use alloy_primitives::B256;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use common::{ContractId, EnodeId};
use contract_manager::ContractHeader;

use crate::file::SectorRef;
use crate::heap::{SegmentKey, UnfinishedSegment, UploadHeap};
use crate::memory::MemoryManager;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("session to host failed: {0}")]
    Session(String),
    #[error("host rejected the sector: {0}")]
    Rejected(String),
    #[error("upload canceled")]
    Canceled,
}

/// Pushes one sector to one host under a contract. The implementation owns
/// the session/revision machinery; this crate only schedules.
#[async_trait]
pub trait SectorUploader: Send + Sync {
    async fn upload_sector(
        &self,
        contract: ContractId,
        host: EnodeId,
        data: Vec<u8>,
    ) -> Result<B256, UploadError>;
}

struct SectorJob {
    sector_index: usize,
    data: Vec<u8>,
    dispatch: Arc<SegmentDispatch>,
}

struct WorkerHandle {
    contract: ContractId,
    jobs: mpsc::UnboundedSender<SectorJob>,
}

/// One worker per host currently under contract.
pub struct WorkerPool {
    workers: RwLock<HashMap<EnodeId, WorkerHandle>>,
    uploader: Arc<dyn SectorUploader>,
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(uploader: Arc<dyn SectorUploader>, cancel: CancellationToken) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            uploader,
            cancel,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    pub fn hosts(&self) -> Vec<EnodeId> {
        self.workers.read().keys().copied().collect()
    }

    /// Reconcile the pool against the current contract set: spawn workers
    /// for new upload-able contracts, drop workers whose contracts are gone
    /// or unusable.
    pub fn activate(&self, contracts: &[ContractHeader]) {
        let mut workers = self.workers.write();

        let mut wanted: HashMap<EnodeId, ContractId> = HashMap::new();
        for contract in contracts {
            if contract.status.upload_ability && !contract.status.canceled {
                wanted.insert(contract.enode_id, contract.id);
            }
        }

        // Dropping the sender shuts the worker task down
        workers.retain(|host, handle| {
            wanted.get(host).map(|id| *id == handle.contract).unwrap_or(false)
        });

        for (host, contract) in wanted {
            if workers.contains_key(&host) {
                continue;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            workers.insert(
                host,
                WorkerHandle {
                    contract,
                    jobs: tx,
                },
            );
            tokio::spawn(worker_loop(
                host,
                contract,
                rx,
                self.uploader.clone(),
                self.cancel.clone(),
            ));
        }
    }

    fn send_job(&self, host: &EnodeId, job: SectorJob) -> Result<(), SectorJob> {
        let workers = self.workers.read();
        match workers.get(host) {
            Some(handle) => handle.jobs.send(job).map_err(|e| e.0),
            None => Err(job),
        }
    }
}

async fn worker_loop(
    host: EnodeId,
    contract: ContractId,
    mut jobs: mpsc::UnboundedReceiver<SectorJob>,
    uploader: Arc<dyn SectorUploader>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => return,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => return,
            },
        };

        let sector_index = job.sector_index;
        match uploader.upload_sector(contract, host, job.data).await {
            Ok(root) => job.dispatch.sector_uploaded(sector_index, host, root),
            Err(e) => {
                debug!(host = %host, sector = sector_index, error = %e, "Sector upload failed");
                job.dispatch.sector_failed();
            }
        }
    }
}

/// Tracks one in-flight segment across its sector jobs and cleans up after
/// the last one.
pub struct SegmentDispatch {
    key: SegmentKey,
    segment: Mutex<UnfinishedSegment>,
    outstanding: Mutex<usize>,
    failures: Mutex<usize>,
    heap: Arc<UploadHeap>,
    memory: Arc<MemoryManager>,
}

impl SegmentDispatch {
    /// Hand every missing sector of `segment` to a distinct worker.
    ///
    /// The segment must already hold its memory reservation and sit in the
    /// heap's repairing set. Missing sectors with no available worker count
    /// as failures up front.
    pub fn dispatch(
        pool: &WorkerPool,
        heap: Arc<UploadHeap>,
        memory: Arc<MemoryManager>,
        mut segment: UnfinishedSegment,
    ) {
        let key = segment.key;

        // Pair each open slot with an unused worker host
        let mut assignments: Vec<(usize, EnodeId, Vec<u8>)> = Vec::new();
        let worker_hosts = pool.hosts();
        let mut available: Vec<EnodeId> = worker_hosts
            .into_iter()
            .filter(|h| segment.unused_hosts.contains(h))
            .collect();
        for (sector_index, filled) in segment.sector_slots_status.iter().enumerate() {
            if *filled {
                continue;
            }
            let Some(host) = available.pop() else {
                break;
            };
            let data = segment
                .physical_segment_data
                .get(sector_index)
                .and_then(|d| d.clone())
                .unwrap_or_default();
            segment.unused_hosts.remove(&host);
            assignments.push((sector_index, host, data));
        }

        let unassigned =
            segment.sector_slots_status.iter().filter(|f| !**f).count() - assignments.len();

        let dispatch = Arc::new(SegmentDispatch {
            key,
            segment: Mutex::new(segment),
            outstanding: Mutex::new(assignments.len()),
            failures: Mutex::new(unassigned),
            heap,
            memory,
        });

        if assignments.is_empty() {
            dispatch.finish();
            return;
        }

        for (sector_index, host, data) in assignments {
            let job = SectorJob {
                sector_index,
                data,
                dispatch: dispatch.clone(),
            };
            if let Err(job) = pool.send_job(&host, job) {
                job.dispatch.sector_failed();
            }
        }
    }

    /// A worker landed a sector: record the replica and the slot.
    fn sector_uploaded(&self, sector_index: usize, host: EnodeId, root: B256) {
        {
            let mut segment = self.segment.lock();
            if !segment.sector_slots_status[sector_index] {
                segment.sector_slots_status[sector_index] = true;
                segment.sectors_completed_num += 1;
            }
            let mut file = segment.file.meta.write();
            file.add_sector(
                segment.index as usize,
                sector_index,
                SectorRef { host, root },
            );
        }
        self.job_done();
    }

    fn sector_failed(&self) {
        *self.failures.lock() += 1;
        self.job_done();
    }

    fn job_done(&self) {
        let remaining = {
            let mut outstanding = self.outstanding.lock();
            *outstanding = outstanding.saturating_sub(1);
            *outstanding
        };
        if remaining == 0 {
            self.finish();
        }
    }

    /// Last job done: settle the segment's stuck flag and give back the
    /// memory reservation and the repairing slot.
    fn finish(&self) {
        let segment = self.segment.lock();
        let complete = segment.sectors_completed_num >= segment.sectors_need_num;
        let failures = *self.failures.lock();

        {
            let mut file = segment.file.meta.write();
            let index = segment.index as usize;
            if complete {
                file.set_stuck(index, false);
                file.time_recent_repair = common::now_secs();
            } else if failures > 0 {
                file.set_stuck(index, true);
            }
        }
        if !complete && failures > 0 {
            self.heap.stuck_segment_found.notify_one();
        }

        self.memory.release(segment.memory_needed);
        self.heap.finish_repair(&self.key);
        if !complete {
            warn!(
                segment = ?self.key,
                completed = segment.sectors_completed_num,
                needed = segment.sectors_need_num,
                failures,
                "Segment repair finished incomplete"
            );
        }
    }
}
