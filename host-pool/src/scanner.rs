//! Background host scanning.
//!
//! A FIFO wait-list feeds a bounded set of concurrent probes. Every probe
//! asks the host for its current config; the outcome updates the host's
//! scan-record ring, uptime accounting and interaction counters, re-scores
//! it, and may remove the host entirely when its up-rate falls below the
//! age-dependent criterion.
//!
//! `initial_scan_finished` flips exactly once, after the first full sweep:
//! selection refuses to run before that because unscanned hosts all carry
//! provisional scores.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use common::{now_secs, EnodeId, HostConfig, HostInfo, ScanRecord, BLOCKS_PER_WEEK};

use crate::HostPoolManager;

/// Upper bound on concurrently running probes.
pub const MAX_SCAN_WORKERS: usize = 8;

/// Seconds between full rescans of the pool.
pub const SCAN_INTERVAL_SECS: u64 = 600;

/// Up-rate ceiling the removal criterion converges to.
pub const UPTIME_CAP: f64 = 0.98;

/// Up-rate demanded of a brand-new host.
pub const CRIT_INTERCEPT: f64 = 0.30;

/// Age scale (in blocks) of the criterion's tightening curve.
pub const CRIT_REMOVE_BASE: u64 = BLOCKS_PER_WEEK;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("host returned a malformed config: {0}")]
    BadConfig(String),
    #[error("probe timed out")]
    Timeout,
}

/// Fetches a host's current config over the wire.
#[async_trait]
pub trait HostProber: Send + Sync {
    async fn probe(&self, host: &HostInfo) -> Result<HostConfig, ProbeError>;
}

/// Whether this node currently has connectivity. A probe failure while the
/// node itself is offline says nothing about the host.
pub trait OnlineSource: Send + Sync {
    fn online(&self) -> bool;
}

/// Minimum up-rate a host must hold at the given age to stay in the pool.
///
/// Starts at [`CRIT_INTERCEPT`] for new hosts and tightens toward
/// [`UPTIME_CAP`] as the host ages.
pub fn removal_criterion(info: &HostInfo, block_height: u64) -> f64 {
    let age = block_height.saturating_sub(info.first_seen) as f64;
    UPTIME_CAP - (UPTIME_CAP - CRIT_INTERCEPT) / (age / CRIT_REMOVE_BASE as f64 + 1.0)
}

/// Whether the host's observed up-rate has fallen below the criterion.
pub fn should_remove_host(info: &HostInfo, block_height: u64) -> bool {
    info.up_rate() <= removal_criterion(info, block_height)
}

/// The long-running scan loop: one initial sweep, then periodic rescans
/// until cancellation.
pub(crate) async fn scan_loop(manager: Arc<HostPoolManager>, online: Arc<dyn OnlineSource>) {
    manager.queue_all_hosts();
    manager.drain_scan_queue(online.as_ref()).await;
    manager.finish_initial_scan();
    info!("Host pool initial scan finished");

    let mut ticker = interval(Duration::from_secs(SCAN_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = manager.cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        manager.queue_all_hosts();
        manager.drain_scan_queue(online.as_ref()).await;
    }
}

impl HostPoolManager {
    /// Work through the scan wait-list with bounded concurrency.
    pub(crate) async fn drain_scan_queue(self: &Arc<Self>, online: &dyn OnlineSource) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let batch = self.pop_scan_batch(MAX_SCAN_WORKERS);
            if batch.is_empty() {
                return;
            }

            let mut probes = JoinSet::new();
            for host in batch {
                let prober = self.prober.clone();
                probes.spawn(async move {
                    let outcome = prober.probe(&host).await;
                    (host.enode_id, outcome)
                });
            }
            while let Some(joined) = probes.join_next().await {
                match joined {
                    Ok((id, outcome)) => {
                        self.apply_scan_outcome(id, outcome, online.online(), now_secs())
                    }
                    Err(e) => warn!(error = %e, "Scan probe task failed"),
                }
            }
        }
    }

    /// Fold one probe outcome into the host's record.
    pub(crate) fn apply_scan_outcome(
        &self,
        id: EnodeId,
        outcome: Result<HostConfig, ProbeError>,
        online: bool,
        now: u64,
    ) {
        // A failure while we ourselves are offline proves nothing
        if outcome.is_err() && !online {
            debug!(host = %id, "Skipping scan outcome while offline");
            return;
        }

        let mut state = self.state.write();
        let Some(mut info) = state.tree.retrieve(&id) else {
            return;
        };

        let success = outcome.is_ok();
        if let Ok(config) = outcome {
            info.config = config;
        }

        // Time since the previous probe accrues to whichever state the host
        // was last observed in.
        if let Some(prev) = info.scan_records.back() {
            let delta = now.saturating_sub(prev.timestamp);
            if prev.success {
                info.historical_uptime += delta;
            } else {
                info.historical_downtime += delta;
            }
        }
        info.push_scan_record(ScanRecord {
            timestamp: now,
            success,
        });
        info.interactions.record(success, true);

        let height = self.block_height();
        if should_remove_host(&info, height) {
            info!(
                host = %id,
                up_rate = info.up_rate(),
                criterion = removal_criterion(&info, height),
                "Removing host below uptime criterion"
            );
            let _ = Self::remove_locked(&mut state, &id);
            return;
        }

        let eval = state.evaluator.evaluate(&info, height);
        if let Err(e) = Self::modify_locked(&mut state, info, eval) {
            debug!(host = %id, error = %e, "Host vanished during scan update");
        }
    }
}
