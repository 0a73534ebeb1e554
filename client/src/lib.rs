//! The storage client: upload and repair engine.
//!
//! One [`StorageClient`] instance owns the host pool, the contract manager,
//! the file registry, the upload heap, the memory budget and the worker
//! pool. [`StorageClient::start`] brings up the background loops;
//! [`StorageClient::close`] tears everything down through one cancellation
//! token.
//!
//! The repair path runs in two loops: the main loop pulls the worst-health
//! file and pushes its unstuck segments through the heap to the workers,
//! while the stuck loop picks one random stuck segment at a time so a
//! permanently broken file cannot monopolize repair bandwidth.

pub mod file;
pub mod heap;
pub mod memory;
pub mod repair;
pub mod worker;

pub use file::{
    DirMetadata, DxFile, DxFileHandle, ErasureParams, FileSet, FileUid, SectorRef, SegmentMeta,
    COMPLETE_HEALTH_THRESHOLD, REPAIR_HEALTH_THRESHOLD, UNSTUCK_HEALTH_THRESHOLD,
};
pub use heap::{SegmentKey, UnfinishedSegment, UploadHeap};
pub use memory::MemoryManager;
pub use repair::RepairTarget;
pub use worker::{SectorUploader, UploadError, WorkerPool};

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use common::backend::ChainBackend;
use common::ContractUtilitySource;
use contract_manager::ContractManager;
use host_pool::scanner::OnlineSource;
use host_pool::HostPoolManager;

/// Tuning knobs of the repair engine.
#[derive(Debug, Clone)]
pub struct StorageClientConfig {
    /// Total buffer memory the repair pipeline may hold at once
    pub memory_capacity: u64,
    /// Dispatches before the upload loop yields back to the scheduler
    pub max_consecutive_segment_uploads: usize,
    /// How long one upload-loop run may work off a possibly stale heap
    pub rebuild_heap_interval: Duration,
    /// Back-off after a failed repair iteration
    pub repair_error_sleep: Duration,
    /// Seconds a file rests after a completed repair pass
    pub file_repair_interval_secs: u64,
    /// Poll cadence while waiting for the chain to come online
    pub online_check_interval: Duration,
}

impl Default for StorageClientConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 512 * 1024 * 1024,
            max_consecutive_segment_uploads: 10,
            rebuild_heap_interval: Duration::from_secs(15 * 60),
            repair_error_sleep: Duration::from_secs(10),
            file_repair_interval_secs: 300,
            online_check_interval: Duration::from_secs(2),
        }
    }
}

/// The per-node storage client instance.
pub struct StorageClient {
    pub(crate) config: StorageClientConfig,
    pub(crate) backend: Arc<dyn ChainBackend>,
    pub(crate) host_pool: Arc<HostPoolManager>,
    pub(crate) contract_manager: Arc<ContractManager>,
    pub(crate) file_set: Arc<FileSet>,
    pub(crate) upload_heap: Arc<UploadHeap>,
    pub(crate) memory: Arc<MemoryManager>,
    pub(crate) worker_pool: WorkerPool,
    pub(crate) cancel: CancellationToken,
}

/// Adapter handing the chain's connectivity view to the host-pool scanner.
struct BackendOnline(Arc<dyn ChainBackend>);

impl OnlineSource for BackendOnline {
    fn online(&self) -> bool {
        self.0.online()
    }
}

impl StorageClient {
    pub fn new(
        config: StorageClientConfig,
        backend: Arc<dyn ChainBackend>,
        host_pool: Arc<HostPoolManager>,
        contract_manager: Arc<ContractManager>,
        uploader: Arc<dyn SectorUploader>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        Arc::new(Self {
            memory: Arc::new(MemoryManager::new(config.memory_capacity)),
            config,
            backend,
            host_pool,
            contract_manager,
            file_set: Arc::new(FileSet::new()),
            upload_heap: Arc::new(UploadHeap::new()),
            worker_pool: WorkerPool::new(uploader, cancel.clone()),
            cancel,
        })
    }

    /// Bring up the host pool, the contract manager and the repair loops.
    pub fn start(self: &Arc<Self>) {
        self.host_pool.start(Arc::new(BackendOnline(self.backend.clone())));
        self.contract_manager.start();

        let client = self.clone();
        tokio::spawn(client.clone().upload_and_repair_loop());
        let client = self.clone();
        tokio::spawn(client.stuck_repair_loop());

        info!("Storage client started");
    }

    /// Stop every loop and persist final snapshots.
    pub fn close(&self) -> io::Result<()> {
        self.cancel.cancel();
        self.memory.stop();
        let contracts = self.contract_manager.close();
        let pool = self.host_pool.close();
        contracts.and(pool)
    }

    pub fn file_set(&self) -> &Arc<FileSet> {
        &self.file_set
    }

    pub fn upload_heap(&self) -> &Arc<UploadHeap> {
        &self.upload_heap
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn contract_manager(&self) -> &Arc<ContractManager> {
        &self.contract_manager
    }

    /// Register a new file and wake the repair loop for its first upload.
    pub fn add_file(&self, file: DxFile) -> Arc<DxFileHandle> {
        let handle = self.file_set.insert(file);
        self.upload_heap.new_uploads.notify_one();
        handle
    }

    /// Nudge the repair loop after external health changes.
    pub fn signal_repair_needed(&self) {
        self.upload_heap.repair_needed.notify_one();
    }

    pub(crate) fn online(&self) -> bool {
        self.backend.online() && self.backend.synced()
    }

    pub(crate) fn utility(&self) -> &dyn ContractUtilitySource {
        self.contract_manager.as_ref()
    }
}
