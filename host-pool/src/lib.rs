//! The storage host pool: a scored directory of known hosts.
//!
//! The pool learns about hosts (chain announcements, snapshot reload), keeps
//! probing them in the background, and answers weighted random selection for
//! contract formation. Two trees are maintained: the full tree and, when a
//! whitelist is active, a filtered tree holding only whitelisted hosts.
//! Selection always draws from the filtered view, retrieval from the full
//! one.
//!
//! Lock order inside this crate: the pool state lock first, the block-height
//! lock second, never the reverse. Neither is ever held across I/O.

pub mod evaluator;
pub mod ip;
pub mod persist;
pub mod scanner;
pub mod tree;

use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::{EnodeId, HostInfo, RentPayment};

use evaluator::{DefaultEvaluator, EvaluationDetail, HostEvaluator};
use ip::IpFilter;
use persist::{HostPoolSettings, AUTO_SAVE_INTERVAL_SECS};
use scanner::{HostProber, OnlineSource};
use tree::{HostTree, TreeError};

/// Host filtering regimes. Under a whitelist only listed hosts may form
/// contracts; under a blacklist listed hosts may not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterMode {
    #[default]
    Disable,
    Whitelist,
    Blacklist,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("host pool initial scan is not finished")]
    InitialScanIncomplete,
}

/// A host's rank entry with its score breakdown.
#[derive(Debug, Clone)]
pub struct StorageHostRank {
    pub enode_id: EnodeId,
    pub detail: EvaluationDetail,
}

struct PoolState {
    rent: RentPayment,
    evaluator: Box<dyn HostEvaluator>,
    tree: HostTree,
    filtered_tree: HostTree,
    filter_mode: FilterMode,
    filtered_hosts: HashSet<EnodeId>,
    ip_violation_check: bool,
}

#[derive(Default)]
struct ScanQueue {
    wait_list: VecDeque<HostInfo>,
    lookup: HashSet<EnodeId>,
}

/// The host pool manager. One instance per node; create with [`Self::new`],
/// bring up the background loops with [`Self::start`], tear down with
/// [`Self::close`].
pub struct HostPoolManager {
    state: RwLock<PoolState>,
    block_height: RwLock<u64>,
    initial_scan_finished: AtomicBool,
    scan_queue: Mutex<ScanQueue>,
    prober: Arc<dyn HostProber>,
    persist_dir: PathBuf,
    pub(crate) cancel: CancellationToken,
}

impl HostPoolManager {
    /// Build the pool, reloading any prior snapshot from `persist_dir`.
    pub fn new(persist_dir: impl Into<PathBuf>, prober: Arc<dyn HostProber>) -> io::Result<Self> {
        let persist_dir = persist_dir.into();
        let snapshot = persist::load_settings(&persist_dir)?;

        let rent = snapshot
            .as_ref()
            .map(|s| s.rent.clone())
            .unwrap_or_default();
        let block_height = snapshot.as_ref().map(|s| s.block_height).unwrap_or(0);
        let evaluator: Box<dyn HostEvaluator> = Box::new(DefaultEvaluator::new(rent.clone()));

        let mut state = PoolState {
            rent,
            evaluator,
            tree: HostTree::new(),
            filtered_tree: HostTree::new(),
            filter_mode: snapshot.as_ref().map(|s| s.filter_mode).unwrap_or_default(),
            filtered_hosts: snapshot
                .as_ref()
                .map(|s| s.filtered_hosts.iter().copied().collect())
                .unwrap_or_default(),
            ip_violation_check: snapshot
                .as_ref()
                .map(|s| s.ip_violation_check)
                .unwrap_or(false),
        };

        if let Some(snapshot) = snapshot {
            for host in snapshot.hosts {
                let eval = state.evaluator.evaluate(&host, block_height);
                if state.tree.insert(host.clone(), eval).is_err() {
                    continue;
                }
                if state.filter_mode == FilterMode::Whitelist
                    && state.filtered_hosts.contains(&host.enode_id)
                {
                    let _ = state.filtered_tree.insert(host, eval);
                }
            }
        }

        info!(hosts = state.tree.len(), "Host pool manager initialized");

        Ok(Self {
            state: RwLock::new(state),
            block_height: RwLock::new(block_height),
            initial_scan_finished: AtomicBool::new(false),
            scan_queue: Mutex::new(ScanQueue::default()),
            prober,
            persist_dir,
            cancel: CancellationToken::new(),
        })
    }

    /// Spawn the background scanner and the snapshot autosave loop.
    pub fn start(self: &Arc<Self>, online: Arc<dyn OnlineSource>) {
        let manager = self.clone();
        tokio::spawn(scanner::scan_loop(manager, online));

        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(AUTO_SAVE_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = manager.save_settings() {
                    warn!(error = %e, "Host pool autosave failed");
                }
            }
        });

        info!("Host pool manager started");
    }

    /// Stop the background loops and persist a final snapshot.
    pub fn close(&self) -> io::Result<()> {
        self.cancel.cancel();
        self.save_settings()
    }

    // ------------------------------------------------------------------
    // Pool mutation
    // ------------------------------------------------------------------

    /// Add a newly learned host and queue it for scanning.
    pub fn insert(&self, info: HostInfo) -> Result<(), TreeError> {
        {
            let mut state = self.state.write();
            let eval = self.evaluate_locked(&state, &info);
            state.tree.insert(info.clone(), eval)?;
            if state.filter_mode == FilterMode::Whitelist
                && state.filtered_hosts.contains(&info.enode_id)
            {
                match state.filtered_tree.insert(info.clone(), eval) {
                    Ok(()) | Err(TreeError::HostExists) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        self.queue_scan(info);
        Ok(())
    }

    /// Drop a host from the pool entirely.
    pub fn remove(&self, id: &EnodeId) -> Result<(), TreeError> {
        let mut state = self.state.write();
        Self::remove_locked(&mut state, id)
    }

    fn remove_locked(state: &mut PoolState, id: &EnodeId) -> Result<(), TreeError> {
        let removed = state.tree.remove(id);
        if state.filter_mode == FilterMode::Whitelist && state.filtered_hosts.contains(id) {
            match state.filtered_tree.remove(id) {
                Ok(()) | Err(TreeError::HostNotExists) => {}
                Err(e) => return Err(e),
            }
        }
        removed
    }

    /// Replace a host's record, re-scoring it.
    pub fn modify(&self, info: HostInfo) -> Result<(), TreeError> {
        let mut state = self.state.write();
        let eval = self.evaluate_locked(&state, &info);
        Self::modify_locked(&mut state, info, eval)
    }

    fn modify_locked(state: &mut PoolState, info: HostInfo, eval: u64) -> Result<(), TreeError> {
        state.tree.update(info.clone(), eval)?;
        if state.filter_mode == FilterMode::Whitelist
            && state.filtered_hosts.contains(&info.enode_id)
        {
            match state.filtered_tree.update(info, eval) {
                Ok(()) | Err(TreeError::HostNotExists) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Fetch a host with its `filtered` flag resolved against the active
    /// filter mode.
    pub fn retrieve_host_info(&self, id: &EnodeId) -> Option<HostInfo> {
        let state = self.state.read();
        let mut info = state.tree.retrieve(id)?;
        let whitelisted = state.filter_mode == FilterMode::Whitelist;
        info.filtered = whitelisted != state.filtered_hosts.contains(id);
        Some(info)
    }

    /// All hosts currently in the pool.
    pub fn all_hosts(&self) -> Vec<HostInfo> {
        self.state.read().tree.all()
    }

    /// Hosts whose latest scan succeeded and which accept contracts.
    pub fn active_storage_hosts(&self) -> Vec<HostInfo> {
        self.state
            .read()
            .tree
            .all()
            .into_iter()
            .filter(|h| h.last_scan_success() && h.config.accepting_contracts)
            .collect()
    }

    /// Score breakdown for every host, for operator display.
    pub fn storage_host_ranks(&self) -> Vec<StorageHostRank> {
        let state = self.state.read();
        let height = *self.block_height.read();
        state
            .tree
            .all()
            .iter()
            .map(|host| StorageHostRank {
                enode_id: host.enode_id,
                detail: state.evaluator.evaluate_detail(host, height),
            })
            .collect()
    }

    /// Score a single host against the current rent payment.
    pub fn evaluate(&self, info: &HostInfo) -> u64 {
        let state = self.state.read();
        self.evaluate_locked(&state, info)
    }

    fn evaluate_locked(&self, state: &PoolState, info: &HostInfo) -> u64 {
        state.evaluator.evaluate(info, *self.block_height.read())
    }

    // ------------------------------------------------------------------
    // Rent payment & filtering
    // ------------------------------------------------------------------

    pub fn retrieve_rent_payment(&self) -> RentPayment {
        self.state.read().rent.clone()
    }

    /// Swap in a new rent payment and re-score both trees against it.
    pub fn set_rent_payment(&self, rent: RentPayment) {
        let mut state = self.state.write();
        state.rent = rent.clone();
        state.evaluator = Box::new(DefaultEvaluator::new(rent));
        let height = *self.block_height.read();

        for host in state.tree.all() {
            let eval = state.evaluator.evaluate(&host, height);
            // A host removed concurrently is fine to skip
            let _ = state.tree.update(host, eval);
        }
        for host in state.filtered_tree.all() {
            let eval = state.evaluator.evaluate(&host, height);
            let _ = state.filtered_tree.update(host, eval);
        }
    }

    /// Install a filter. Whitelist mode rebuilds the filtered tree from the
    /// listed hosts.
    pub fn set_filter_mode(&self, mode: FilterMode, hosts: &[EnodeId]) {
        let mut state = self.state.write();
        let height = *self.block_height.read();
        state.filter_mode = mode;
        state.filtered_hosts = hosts.iter().copied().collect();
        state.filtered_tree = HostTree::new();
        if mode == FilterMode::Whitelist {
            for id in hosts {
                if let Some(info) = state.tree.retrieve(id) {
                    let eval = state.evaluator.evaluate(&info, height);
                    let _ = state.filtered_tree.insert(info, eval);
                }
            }
        }
        debug!(?mode, hosts = hosts.len(), "Host filter mode updated");
    }

    pub fn filter_mode(&self) -> FilterMode {
        self.state.read().filter_mode
    }

    pub fn set_ip_violation_check(&self, enabled: bool) {
        self.state.write().ip_violation_check = enabled;
    }

    pub fn ip_violation_check(&self) -> bool {
        self.state.read().ip_violation_check
    }

    /// Of the given hosts, which must not be used together because they share
    /// a subnet. Hosts that changed networks earliest keep their claim;
    /// unknown ids are always reported bad.
    pub fn filter_ip_violations(&self, ids: &[EnodeId]) -> Vec<EnodeId> {
        let state = self.state.read();
        let mut bad = Vec::new();
        if !state.ip_violation_check {
            return bad;
        }

        let mut known: Vec<HostInfo> = Vec::with_capacity(ids.len());
        for id in ids {
            match state.tree.retrieve(id) {
                Some(info) => known.push(info),
                None => bad.push(*id),
            }
        }

        known.sort_by_key(|info| info.last_ip_network_change);

        let mut filter = IpFilter::new();
        for info in known {
            if filter.filtered(&info.ip) {
                bad.push(info.enode_id);
                continue;
            }
            filter.add(&info.ip);
        }
        bad
    }

    // ------------------------------------------------------------------
    // Selection
    // ------------------------------------------------------------------

    /// Weighted random host selection for contract formation.
    ///
    /// Callers must blacklist the hosts of their existing contracts.
    /// Refuses to answer before the initial scan has completed: scores are
    /// meaningless until every known host has been probed once.
    pub fn select_random(
        &self,
        n: usize,
        id_blacklist: &[EnodeId],
        addr_blacklist: &[EnodeId],
    ) -> Result<Vec<HostInfo>, SelectError> {
        if !self.is_initial_scan_finished() {
            return Err(SelectError::InitialScanIncomplete);
        }
        let state = self.state.read();
        let source = match state.filter_mode {
            FilterMode::Whitelist => &state.filtered_tree,
            _ => &state.tree,
        };
        let picked = if state.ip_violation_check {
            source.select_random(n, id_blacklist, Some(addr_blacklist))
        } else {
            source.select_random(n, id_blacklist, None)
        };
        Ok(picked)
    }

    // ------------------------------------------------------------------
    // Interactions
    // ------------------------------------------------------------------

    /// Credit a successful negotiation-level interaction with the host.
    pub fn increment_successful_interactions(&self, id: &EnodeId) {
        self.record_interaction(id, true);
    }

    /// Debit a failed negotiation-level interaction with the host.
    pub fn increment_failed_interactions(&self, id: &EnodeId) {
        self.record_interaction(id, false);
    }

    fn record_interaction(&self, id: &EnodeId, success: bool) {
        let mut state = self.state.write();
        let Some(mut info) = state.tree.retrieve(id) else {
            return;
        };
        info.interactions.record(success, false);
        let eval = self.evaluate_locked(&state, &info);
        let _ = Self::modify_locked(&mut state, info, eval);
    }

    // ------------------------------------------------------------------
    // Block height
    // ------------------------------------------------------------------

    pub fn block_height(&self) -> u64 {
        *self.block_height.read()
    }

    pub fn set_block_height(&self, height: u64) {
        *self.block_height.write() = height;
    }

    pub fn increment_block_height(&self) {
        *self.block_height.write() += 1;
    }

    pub fn decrement_block_height(&self) {
        let mut height = self.block_height.write();
        *height = height.saturating_sub(1);
    }

    // ------------------------------------------------------------------
    // Scan bookkeeping
    // ------------------------------------------------------------------

    pub fn is_initial_scan_finished(&self) -> bool {
        self.initial_scan_finished.load(Ordering::Acquire)
    }

    pub(crate) fn finish_initial_scan(&self) {
        self.initial_scan_finished.store(true, Ordering::Release);
    }

    /// Queue a host for scanning unless it already waits.
    pub(crate) fn queue_scan(&self, info: HostInfo) {
        let mut queue = self.scan_queue.lock();
        if queue.lookup.insert(info.enode_id) {
            queue.wait_list.push_back(info);
        }
    }

    pub(crate) fn queue_all_hosts(&self) {
        for host in self.all_hosts() {
            self.queue_scan(host);
        }
    }

    pub(crate) fn pop_scan_batch(&self, max: usize) -> Vec<HostInfo> {
        let mut queue = self.scan_queue.lock();
        let mut batch = Vec::with_capacity(max.min(queue.wait_list.len()));
        while batch.len() < max {
            let Some(host) = queue.wait_list.pop_front() else {
                break;
            };
            queue.lookup.remove(&host.enode_id);
            batch.push(host);
        }
        batch
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn snapshot(&self) -> HostPoolSettings {
        let state = self.state.read();
        HostPoolSettings {
            rent: state.rent.clone(),
            hosts: state.tree.all(),
            filter_mode: state.filter_mode,
            filtered_hosts: state.filtered_hosts.iter().copied().collect(),
            ip_violation_check: state.ip_violation_check,
            block_height: *self.block_height.read(),
        }
    }

    /// Write the current snapshot to `host.settings.json`.
    pub fn save_settings(&self) -> io::Result<()> {
        persist::save_settings(&self.persist_dir, &self.snapshot())
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use async_trait::async_trait;
    use common::HostConfig;
    use scanner::{OnlineSource, ProbeError};

    /// Prober whose every probe returns the same canned answer.
    pub(crate) struct FixedProber {
        response: Result<HostConfig, ()>,
    }

    impl FixedProber {
        pub(crate) fn healthy() -> Self {
            Self {
                response: Ok(HostConfig {
                    accepting_contracts: true,
                    ..Default::default()
                }),
            }
        }

        pub(crate) fn dead() -> Self {
            Self { response: Err(()) }
        }
    }

    #[async_trait]
    impl HostProber for FixedProber {
        async fn probe(&self, _host: &HostInfo) -> Result<HostConfig, ProbeError> {
            self.response
                .clone()
                .map_err(|_| ProbeError::Unreachable("fixed prober".into()))
        }
    }

    pub(crate) struct AlwaysOnline;

    impl OnlineSource for AlwaysOnline {
        fn online(&self) -> bool {
            true
        }
    }

    pub(crate) fn manager_with(prober: FixedProber) -> HostPoolManager {
        let dir = tempfile::tempdir().unwrap();
        HostPoolManager::new(dir.path(), Arc::new(prober)).unwrap()
    }
}
