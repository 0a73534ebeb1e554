//! Contract lifecycle management.
//!
//! The contract manager owns the active-contract set and everything that
//! happens to it: negotiating new contracts, renewing expiring or
//! underfunded ones, tracking the renewal lineage graph, enforcing the
//! client's funding budget, and persisting all of it. A maintenance pass
//! runs on every block event.
//!
//! Lineage is kept as two id maps (`renewed_from` / `renewed_to`) over an
//! arena of contract records, so chains of renewals never form ownership
//! cycles. The maps are inverses by construction and the graph is a forest
//! of linear chains.

pub mod contract_set;
pub mod maintenance;
pub mod negotiate;
pub mod persist;
pub mod renew;
pub mod responsibility;

pub use contract_set::{AcquiredContract, ContractHeader, ContractSet};
pub use negotiate::{ContractParams, NegotiationError};
pub use renew::RenewRecord;

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use alloy_primitives::Address;
use anyhow::Context;
use parking_lot::RwLock;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chain_tx::AddrLocker;
use common::backend::{ChainBackend, HostConnector, Wallet};
use common::{ContractId, ContractUtility, ContractUtilitySource, EnodeId, RentPayment};
use host_pool::HostPoolManager;

use persist::{ContractSettings, AUTO_SAVE_INTERVAL_SECS};

pub(crate) struct ManagerState {
    pub rent_payment: RentPayment,
    pub current_period: u64,
    pub block_height: u64,
    pub expired_contracts: HashMap<ContractId, ContractHeader>,
    /// successor id → predecessor id
    pub renewed_from: HashMap<ContractId, ContractId>,
    /// predecessor id → successor id
    pub renewed_to: HashMap<ContractId, ContractId>,
    pub failed_renew_count: HashMap<ContractId, u64>,
    pub renewing: HashSet<ContractId>,
}

/// The contract manager. One instance per node, owning the active set and
/// the renewal machinery.
pub struct ContractManager {
    pub(crate) backend: Arc<dyn ChainBackend>,
    pub(crate) connector: Arc<dyn HostConnector>,
    pub(crate) wallet: Arc<dyn Wallet>,
    pub(crate) host_pool: Arc<HostPoolManager>,
    pub(crate) active_contracts: ContractSet,
    pub(crate) nonce_lock: AddrLocker,
    pub(crate) payment_address: Address,
    pub(crate) state: RwLock<ManagerState>,
    pub(crate) maintenance_running: AtomicBool,
    pub(crate) cancel: CancellationToken,
    persist_dir: PathBuf,
}

impl ContractManager {
    /// Build the manager, reloading the settings snapshot and every
    /// persisted contract.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        persist_dir: impl Into<PathBuf>,
        backend: Arc<dyn ChainBackend>,
        connector: Arc<dyn HostConnector>,
        wallet: Arc<dyn Wallet>,
        host_pool: Arc<HostPoolManager>,
        payment_address: Address,
    ) -> io::Result<Self> {
        let persist_dir = persist_dir.into();
        let active_contracts = ContractSet::open(&persist_dir)?;
        let snapshot = persist::load_settings(&persist_dir)?.unwrap_or_default();

        let state = ManagerState {
            rent_payment: snapshot.rent_payment.unwrap_or_default(),
            current_period: snapshot.current_period,
            block_height: snapshot.block_height,
            expired_contracts: snapshot.expired_contracts,
            renewed_from: snapshot.renewed_from,
            renewed_to: snapshot.renewed_to,
            failed_renew_count: HashMap::new(),
            renewing: HashSet::new(),
        };

        info!(
            active = active_contracts.len(),
            expired = state.expired_contracts.len(),
            "Contract manager initialized"
        );

        Ok(Self {
            backend,
            connector,
            wallet,
            host_pool,
            active_contracts,
            nonce_lock: AddrLocker::new(),
            payment_address,
            state: RwLock::new(state),
            maintenance_running: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            persist_dir,
        })
    }

    /// Spawn the maintenance loop and the settings autosave loop.
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(maintenance::maintenance_loop(manager));

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
                    warn!(error = %e, "Contract settings autosave failed");
                }
            }
        });

        info!("Contract manager started");
    }

    /// Stop the loops and persist a final snapshot.
    pub fn close(&self) -> io::Result<()> {
        self.cancel.cancel();
        self.save_settings()
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// The active-contract store.
    pub fn contract_set(&self) -> &ContractSet {
        &self.active_contracts
    }

    /// Metadata of every active contract.
    pub fn contracts(&self) -> Vec<ContractHeader> {
        self.active_contracts.metadatas()
    }

    pub fn rent_payment(&self) -> RentPayment {
        self.state.read().rent_payment.clone()
    }

    /// Install a new rent payment, propagating it to the host pool's scorer.
    pub fn set_rent_payment(&self, rent: RentPayment) {
        self.state.write().rent_payment = rent.clone();
        self.host_pool.set_rent_payment(rent);
    }

    pub fn block_height(&self) -> u64 {
        self.state.read().block_height
    }

    pub fn current_period(&self) -> u64 {
        self.state.read().current_period
    }

    pub fn is_renewing(&self, id: &ContractId) -> bool {
        self.state.read().renewing.contains(id)
    }

    /// A contract gone from the active set but remembered for lineage.
    pub fn expired_contract(&self, id: &ContractId) -> Option<ContractHeader> {
        self.state.read().expired_contracts.get(id).cloned()
    }

    /// The contract this one was renewed from, if any.
    pub fn renewed_from(&self, id: &ContractId) -> Option<ContractId> {
        self.state.read().renewed_from.get(id).copied()
    }

    /// The contract this one was renewed into, if any.
    pub fn renewed_to(&self, id: &ContractId) -> Option<ContractId> {
        self.state.read().renewed_to.get(id).copied()
    }

    /// The chain of successors starting at `id` (inclusive), oldest first.
    /// Used when migrating unfinished-upload sectors onto the live successor.
    pub fn renewed_lineage(&self, id: &ContractId) -> Vec<ContractId> {
        let state = self.state.read();
        let mut chain = vec![*id];
        let mut cursor = *id;
        while let Some(next) = state.renewed_to.get(&cursor) {
            // Lineage is a forest of linear chains; a cycle would be a
            // corrupted snapshot
            if chain.contains(next) {
                warn!(contract = %id, "Cycle detected in renewal lineage");
                break;
            }
            chain.push(*next);
            cursor = *next;
        }
        chain
    }

    // ------------------------------------------------------------------
    // Contract formation
    // ------------------------------------------------------------------

    /// Bring the number of usable contracts up to the rent target by forming
    /// contracts with fresh, non-conflicting hosts.
    pub async fn maintain_contract_count(&self) -> anyhow::Result<Vec<ContractHeader>> {
        let (rent, block_height, current_period) = {
            let state = self.state.read();
            (
                state.rent_payment.clone(),
                state.block_height,
                state.current_period,
            )
        };

        let active = self.contracts();
        let usable = active.iter().filter(|c| !c.status.canceled).count() as u64;
        let needed = rent.storage_hosts.saturating_sub(usable);
        if needed == 0 {
            return Ok(Vec::new());
        }

        // Hosts already under contract must not be picked again
        let blacklist: Vec<EnodeId> = active.iter().map(|c| c.enode_id).collect();
        let candidates = self
            .host_pool
            .select_random((needed as usize) * 2 + 2, &blacklist, &blacklist)
            .context("selecting candidate hosts")?;

        let candidate_ids: Vec<EnodeId> = candidates.iter().map(|h| h.enode_id).collect();
        let violations: HashSet<EnodeId> = self
            .host_pool
            .filter_ip_violations(&candidate_ids)
            .into_iter()
            .collect();

        let funding = rent.fund / alloy_primitives::U256::from(rent.storage_hosts.max(1));
        let end_height = current_period + rent.period;
        let mut formed = Vec::new();
        let mut remaining_fund = self.client_remaining_fund();

        for host in candidates {
            if formed.len() as u64 >= needed {
                break;
            }
            if violations.contains(&host.enode_id) {
                continue;
            }
            if remaining_fund < funding {
                info!(remaining = %remaining_fund, "Contract formation stopped by the fund budget");
                break;
            }
            let params = ContractParams {
                rent_payment: rent.clone(),
                host,
                funding,
                start_height: block_height,
                end_height,
                client_payment_address: self.payment_address,
            };
            match self.contract_create_negotiate(&params).await {
                Ok(header) => {
                    remaining_fund = remaining_fund.saturating_sub(funding);
                    formed.push(header);
                }
                Err(e) => {
                    warn!(host = %params.host.enode_id, error = %e, "Contract formation failed");
                }
            }
            if self.maintenance_should_stop() {
                break;
            }
        }

        if !formed.is_empty() {
            if let Err(e) = self.save_settings() {
                warn!(error = %e, "Failed to persist settings after contract formation");
            }
        }
        Ok(formed)
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn snapshot(&self) -> ContractSettings {
        let state = self.state.read();
        ContractSettings {
            rent_payment: Some(state.rent_payment.clone()),
            current_period: state.current_period,
            block_height: state.block_height,
            expired_contracts: state.expired_contracts.clone(),
            renewed_from: state.renewed_from.clone(),
            renewed_to: state.renewed_to.clone(),
        }
    }

    /// Write the settings snapshot to `contract.settings.json`.
    pub fn save_settings(&self) -> io::Result<()> {
        persist::save_settings(&self.persist_dir, &self.snapshot())
    }
}

impl ContractUtilitySource for ContractManager {
    fn contract_utility(&self, host: &EnodeId) -> Option<ContractUtility> {
        self.active_contracts
            .metadatas()
            .into_iter()
            .find(|c| c.enode_id == *host)
            .map(|c| ContractUtility {
                good_for_upload: c.status.upload_ability && !c.status.canceled,
                good_for_renew: c.status.renew_ability && !c.status.canceled,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Bytes, B256, U256};
    use async_trait::async_trait;
    use common::backend::{
        ChainError, HostSession, SessionError, Transaction, WalletError,
    };
    use common::contracts::{PaymentOutput, StorageContractRevision, UnlockConditions};
    use common::wire::{
        Frame, CLIENT_STOP_MSG, CONTRACT_CREATE_CLIENT_REVISION_SIGN_MSG,
        CONTRACT_CREATE_HOST_SIGN_MSG, CONTRACT_CREATE_REQ_MSG, CONTRACT_CREATE_REVISION_SIGN_MSG,
        HOST_BUSY_MSG, HOST_STOP_MSG, NEGOTIATION_ERROR_MSG,
    };
    use common::{ContractStatus, HostConfig, HostInfo, SECTOR_SIZE};
    use host_pool::scanner::{HostProber, ProbeError};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tokio::sync::broadcast;

    // ------------------------------------------------------------------
    // Mocks
    // ------------------------------------------------------------------

    struct MockBackend {
        submitted: Mutex<usize>,
        blocks: broadcast::Sender<u64>,
    }

    impl MockBackend {
        fn new() -> Self {
            Self {
                submitted: Mutex::new(0),
                blocks: broadcast::channel(16).0,
            }
        }
    }

    #[async_trait]
    impl ChainBackend for MockBackend {
        async fn block_height(&self) -> Result<u64, ChainError> {
            Ok(0)
        }

        fn chain_id(&self) -> Option<u64> {
            Some(7)
        }

        async fn balance(&self, _address: Address) -> Result<U256, ChainError> {
            Ok(U256::MAX)
        }

        async fn state_value(&self, _address: Address, _key: B256) -> Result<B256, ChainError> {
            Ok(B256::ZERO)
        }

        async fn suggest_gas_price(&self) -> Result<U256, ChainError> {
            Ok(U256::from(1u64))
        }

        async fn pool_nonce(&self, _address: Address) -> Result<u64, ChainError> {
            Ok(0)
        }

        async fn send_raw_transaction(&self, _raw: Bytes) -> Result<B256, ChainError> {
            *self.submitted.lock() += 1;
            Ok(B256::repeat_byte(0x5a))
        }

        fn subscribe_blocks(&self) -> broadcast::Receiver<u64> {
            self.blocks.subscribe()
        }

        fn online(&self) -> bool {
            true
        }

        fn synced(&self) -> bool {
            true
        }
    }

    struct MockWallet;

    impl Wallet for MockWallet {
        fn sign_digest(&self, _address: Address, digest: B256) -> Result<Bytes, WalletError> {
            Ok(Bytes::copy_from_slice(digest.as_slice()))
        }

        fn sign_transaction(
            &self,
            _address: Address,
            _tx: &Transaction,
            _chain_id: Option<u64>,
        ) -> Result<Bytes, WalletError> {
            Ok(Bytes::from(vec![0u8; 8]))
        }
    }

    /// Connector that replays canned host frames, one script per session.
    struct ScriptedConnector {
        scripts: Mutex<VecDeque<Vec<Frame>>>,
        sent: Arc<Mutex<Vec<Frame>>>,
    }

    impl ScriptedConnector {
        fn new(scripts: Vec<Vec<Frame>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait]
    impl HostConnector for ScriptedConnector {
        async fn open_session(
            &self,
            _enode_url: &str,
        ) -> Result<Box<dyn HostSession>, SessionError> {
            let script = self
                .scripts
                .lock()
                .pop_front()
                .ok_or_else(|| SessionError::Connect("no script left".into()))?;
            Ok(Box::new(ScriptedSession {
                incoming: script.into(),
                sent: self.sent.clone(),
            }))
        }
    }

    struct ScriptedSession {
        incoming: VecDeque<Frame>,
        sent: Arc<Mutex<Vec<Frame>>>,
    }

    #[async_trait]
    impl HostSession for ScriptedSession {
        async fn send_frame(&mut self, frame: Frame) -> Result<(), SessionError> {
            self.sent.lock().push(frame);
            Ok(())
        }

        async fn read_frame(&mut self) -> Result<Frame, SessionError> {
            self.incoming.pop_front().ok_or(SessionError::Closed)
        }

        async fn close(&mut self) -> Result<(), SessionError> {
            Ok(())
        }
    }

    struct NullProber;

    #[async_trait]
    impl HostProber for NullProber {
        async fn probe(&self, _host: &HostInfo) -> Result<HostConfig, ProbeError> {
            Err(ProbeError::Unreachable("test".into()))
        }
    }

    fn happy_script() -> Vec<Frame> {
        vec![
            Frame::encode(CONTRACT_CREATE_HOST_SIGN_MSG, &Bytes::from(vec![1u8; 65])),
            Frame::encode(CONTRACT_CREATE_REVISION_SIGN_MSG, &Bytes::from(vec![2u8; 65])),
            Frame::new(HOST_STOP_MSG, Bytes::new()),
        ]
    }

    fn test_host(byte: u8) -> HostInfo {
        HostInfo {
            enode_id: EnodeId::from_slice(&[byte; 32]),
            enode_url: format!("enode://host-{byte}"),
            payment_address: Address::repeat_byte(byte),
            ip: format!("10.0.{byte}.1"),
            config: HostConfig {
                accepting_contracts: true,
                storage_price: U256::from(10u64),
                collateral: U256::from(2u64),
                contract_price: U256::from(100u64),
                max_collateral: U256::from(1_000_000_000u64),
                window_size: 100,
                remaining_storage: u64::MAX / 2,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    struct Fixture {
        manager: Arc<ContractManager>,
        backend: Arc<MockBackend>,
        connector: Arc<ScriptedConnector>,
        host_pool: Arc<HostPoolManager>,
        _dir: tempfile::TempDir,
    }

    fn fixture(scripts: Vec<Vec<Frame>>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new());
        let connector = Arc::new(ScriptedConnector::new(scripts));
        let host_pool = Arc::new(
            HostPoolManager::new(dir.path().join("pool"), Arc::new(NullProber)).unwrap(),
        );
        let manager = Arc::new(
            ContractManager::new(
                dir.path().join("contracts"),
                backend.clone(),
                connector.clone(),
                Arc::new(MockWallet),
                host_pool.clone(),
                Address::repeat_byte(0xcc),
            )
            .unwrap(),
        );
        Fixture {
            manager,
            backend,
            connector,
            host_pool,
            _dir: dir,
        }
    }

    fn params_for(host: HostInfo, rent: &RentPayment) -> ContractParams {
        ContractParams {
            rent_payment: rent.clone(),
            host,
            funding: U256::from(1_000_000u64),
            start_height: 10,
            end_height: 10 + rent.period,
            client_payment_address: Address::repeat_byte(0xcc),
        }
    }

    // ------------------------------------------------------------------
    // Negotiation
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn create_negotiation_commits_and_credits_host() {
        let fx = fixture(vec![happy_script()]);
        let host = test_host(1);
        fx.host_pool.insert(host.clone()).unwrap();
        let rent = RentPayment::default();

        let header = fx
            .manager
            .contract_create_negotiate(&params_for(host.clone(), &rent))
            .await
            .unwrap();

        assert_eq!(header.enode_id, host.enode_id);
        assert!(header.status.upload_ability);
        assert!(header.status.renew_ability);
        assert_eq!(header.latest_revision.new_revision_number, 1);
        assert_eq!(header.latest_revision.signatures.len(), 2);

        // Committed into the active set
        assert!(fx.manager.contract_set().contains(&header.id));
        // One precompile tx went out
        assert_eq!(*fx.backend.submitted.lock(), 1);
        // The host got credit
        let info = fx.host_pool.retrieve_host_info(&host.enode_id).unwrap();
        assert_eq!(info.interactions.successful, 1);

        // Utility now reports the host good for upload and renew
        let utility = fx.manager.contract_utility(&host.enode_id).unwrap();
        assert!(utility.good_for_upload);
        assert!(utility.good_for_renew);
    }

    #[tokio::test]
    async fn host_decline_aborts_and_debits() {
        let decline = vec![Frame::encode(
            NEGOTIATION_ERROR_MSG,
            &"collateral budget exhausted".to_string(),
        )];
        let fx = fixture(vec![decline]);
        let host = test_host(1);
        fx.host_pool.insert(host.clone()).unwrap();

        let err = fx
            .manager
            .contract_create_negotiate(&params_for(host.clone(), &RentPayment::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::HostDeclined(_)));
        assert!(fx.manager.contracts().is_empty());
        assert_eq!(*fx.backend.submitted.lock(), 0);
        let info = fx.host_pool.retrieve_host_info(&host.enode_id).unwrap();
        assert_eq!(info.interactions.failed, 1);
    }

    #[tokio::test]
    async fn busy_host_is_not_debited() {
        let busy = vec![Frame::new(HOST_BUSY_MSG, Bytes::new())];
        let fx = fixture(vec![busy]);
        let host = test_host(1);
        fx.host_pool.insert(host.clone()).unwrap();

        let err = fx
            .manager
            .contract_create_negotiate(&params_for(host.clone(), &RentPayment::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::HostBusy));
        let info = fx.host_pool.retrieve_host_info(&host.enode_id).unwrap();
        assert_eq!(info.interactions.failed, 0);
        assert_eq!(info.interactions.successful, 0);
    }

    #[tokio::test]
    async fn client_frames_follow_the_round_order() {
        let fx = fixture(vec![happy_script()]);
        let host = test_host(1);
        fx.host_pool.insert(host.clone()).unwrap();
        fx.manager
            .contract_create_negotiate(&params_for(host, &RentPayment::default()))
            .await
            .unwrap();

        let sent: Vec<u8> = fx.connector.sent.lock().iter().map(|f| f.code).collect();
        assert_eq!(
            sent,
            vec![
                CONTRACT_CREATE_REQ_MSG,
                CONTRACT_CREATE_CLIENT_REVISION_SIGN_MSG,
                CLIENT_STOP_MSG,
            ]
        );
    }

    // ------------------------------------------------------------------
    // Classification
    // ------------------------------------------------------------------

    fn active_header(
        byte: u8,
        host: &HostInfo,
        end_height: u64,
        total_cost: u64,
        balance: u64,
    ) -> ContractHeader {
        ContractHeader {
            id: ContractId::from_slice(&[byte; 32]),
            enode_id: host.enode_id,
            start_height: 0,
            end_height,
            total_cost: U256::from(total_cost),
            contract_fee: U256::from(100u64),
            latest_revision: StorageContractRevision {
                unlock_conditions: UnlockConditions::new(
                    Address::repeat_byte(0xcc),
                    host.payment_address,
                ),
                new_revision_number: 1,
                new_window_end: end_height + host.config.window_size,
                new_valid_proof_outputs: vec![
                    PaymentOutput {
                        value: U256::from(balance),
                        address: Address::repeat_byte(0xcc),
                    },
                    PaymentOutput {
                        value: U256::from(1u64),
                        address: host.payment_address,
                    },
                ],
                new_missed_proof_outputs: vec![
                    PaymentOutput {
                        value: U256::from(balance),
                        address: Address::repeat_byte(0xcc),
                    },
                    PaymentOutput {
                        value: U256::from(1u64),
                        address: host.payment_address,
                    },
                ],
                ..Default::default()
            },
            status: ContractStatus {
                upload_ability: true,
                renew_ability: true,
                canceled: false,
            },
        }
    }

    fn rent_with_window(renew_window: u64) -> RentPayment {
        RentPayment {
            renew_window,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn close_to_expire_boundary_is_exact() {
        let fx = fixture(vec![]);
        let mut host = test_host(1);
        // Prices that cannot trigger the funding branch
        host.config.storage_price = U256::ZERO;
        host.config.upload_bandwidth_price = U256::ZERO;
        host.config.download_bandwidth_price = U256::ZERO;
        fx.host_pool.insert(host.clone()).unwrap();
        fx.manager.set_rent_payment(rent_with_window(100));

        let header = active_header(1, &host, 1000, 10_000, 10_000);
        fx.manager
            .contract_set()
            .insert_contract(header, vec![])
            .unwrap();

        fx.manager.state.write().block_height = 899;
        let (close, insufficient) = fx.manager.check_for_contract_renew();
        assert_eq!(close.len(), 1, "height 899 is inside the renew window");
        assert!(insufficient.is_empty());

        fx.manager.state.write().block_height = 898;
        let (close, insufficient) = fx.manager.check_for_contract_renew();
        assert!(close.is_empty(), "height 898 is outside the renew window");
        assert!(insufficient.is_empty());
    }

    #[tokio::test]
    async fn insufficient_funding_triggers_below_five_percent() {
        let fx = fixture(vec![]);
        let mut host = test_host(1);
        host.config.storage_price = U256::ZERO;
        host.config.upload_bandwidth_price = U256::ZERO;
        host.config.download_bandwidth_price = U256::ZERO;
        fx.host_pool.insert(host.clone()).unwrap();
        fx.manager.set_rent_payment(rent_with_window(100));
        fx.manager.state.write().block_height = 10;

        // balance/total = 299/10000 = 2.99% < 5%
        let header = active_header(1, &host, 1_000_000, 10_000, 299);
        fx.manager
            .contract_set()
            .insert_contract(header.clone(), vec![])
            .unwrap();

        let (close, insufficient) = fx.manager.check_for_contract_renew();
        assert!(close.is_empty());
        assert_eq!(insufficient.len(), 1);
        // Estimated renewal cost is twice the total cost
        assert_eq!(insufficient[0].cost, U256::from(20_000u64));
    }

    #[tokio::test]
    async fn insufficient_funding_triggers_below_three_sector_units() {
        let fx = fixture(vec![]);
        let mut host = test_host(1);
        host.config.storage_price = U256::ZERO;
        host.config.upload_bandwidth_price = U256::from(1u64);
        host.config.download_bandwidth_price = U256::ZERO;
        fx.host_pool.insert(host.clone()).unwrap();
        fx.manager.set_rent_payment(rent_with_window(100));
        fx.manager.state.write().block_height = 10;

        let unit = SECTOR_SIZE; // upload price 1 per byte, nothing else
        let balance = 3 * unit - 1;
        // Keep the ratio branch quiet: balance is well above 5% of total
        let header = active_header(1, &host, 1_000_000, 100, balance);
        fx.manager
            .contract_set()
            .insert_contract(header, vec![])
            .unwrap();

        let (_, insufficient) = fx.manager.check_for_contract_renew();
        assert_eq!(insufficient.len(), 1);
    }

    #[tokio::test]
    async fn filtered_and_unrenewable_contracts_are_skipped() {
        let fx = fixture(vec![]);
        let host = test_host(1);
        fx.host_pool.insert(host.clone()).unwrap();
        fx.manager.set_rent_payment(rent_with_window(100));
        fx.manager.state.write().block_height = 999;

        let mut header = active_header(1, &host, 1000, 10_000, 10_000);
        header.status.renew_ability = false;
        fx.manager
            .contract_set()
            .insert_contract(header, vec![])
            .unwrap();

        let (close, insufficient) = fx.manager.check_for_contract_renew();
        assert!(close.is_empty());
        assert!(insufficient.is_empty());

        // Same contract, renewable, but with the host filtered out
        let host2 = test_host(2);
        fx.host_pool.insert(host2.clone()).unwrap();
        fx.manager
            .contract_set()
            .insert_contract(active_header(2, &host2, 1000, 10_000, 10_000), vec![])
            .unwrap();
        fx.host_pool
            .set_filter_mode(host_pool::FilterMode::Blacklist, &[host2.enode_id]);
        let (close, _) = fx.manager.check_for_contract_renew();
        assert!(close.is_empty());
    }

    // ------------------------------------------------------------------
    // Renewal execution
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn successful_renew_updates_lineage_and_statuses() {
        let fx = fixture(vec![happy_script()]);
        let host = test_host(1);
        fx.host_pool.insert(host.clone()).unwrap();
        let rent = rent_with_window(100);
        fx.manager.set_rent_payment(rent.clone());
        fx.manager.state.write().block_height = 950;

        let old = active_header(1, &host, 1000, 10_000, 10_000);
        fx.manager
            .contract_set()
            .insert_contract(old.clone(), vec![B256::repeat_byte(0xaa)])
            .unwrap();

        let record = RenewRecord {
            id: old.id,
            cost: U256::from(1_000_000u64),
        };
        let (spent, result) = fx
            .manager
            .contract_renew_start(&record, &rent, 950, 1000 + rent.period)
            .await;
        result.unwrap();
        assert_eq!(spent, U256::from(1_000_000u64));

        // Predecessor left the active set into the expired table, canceled
        assert!(!fx.manager.contract_set().contains(&old.id));
        let expired = fx.manager.expired_contract(&old.id).unwrap();
        assert!(expired.status.canceled);
        assert!(!expired.status.upload_ability);

        // Exactly one active contract remains: the successor
        let active = fx.manager.contracts();
        assert_eq!(active.len(), 1);
        let successor = &active[0];
        assert!(successor.status.upload_ability);
        assert!(successor.status.renew_ability);

        // Lineage maps are inverses
        assert_eq!(fx.manager.renewed_from(&successor.id), Some(old.id));
        assert_eq!(fx.manager.renewed_to(&old.id), Some(successor.id));
        assert_eq!(
            fx.manager.renewed_lineage(&old.id),
            vec![old.id, successor.id]
        );

        // The predecessor's merkle roots were carried into the successor
        let acquired = fx
            .manager
            .contract_set()
            .acquire(&successor.id)
            .await
            .unwrap();
        assert_eq!(acquired.merkle_roots(), vec![B256::repeat_byte(0xaa)]);

        // No contract id lives in both tables
        assert!(fx.manager.expired_contract(&successor.id).is_none());
    }

    #[tokio::test]
    async fn failed_renew_cancels_only_after_repeated_failures_past_half_window() {
        // Every session attempt gets declined
        let decline = || vec![Frame::encode(NEGOTIATION_ERROR_MSG, &"no".to_string())];
        let fx = fixture(vec![decline(), decline(), decline(), decline()]);
        let host = test_host(1);
        fx.host_pool.insert(host.clone()).unwrap();
        let rent = rent_with_window(100);
        fx.manager.set_rent_payment(rent.clone());

        let old = active_header(1, &host, 1000, 10_000, 10_000);
        fx.manager
            .contract_set()
            .insert_contract(old.clone(), vec![])
            .unwrap();
        let record = RenewRecord {
            id: old.id,
            cost: U256::from(1_000_000u64),
        };

        // Early in the window: failures accumulate but nothing is canceled
        for _ in 0..3 {
            let (spent, result) = fx
                .manager
                .contract_renew_start(&record, &rent, 901, 1000 + rent.period)
                .await;
            assert!(result.is_err());
            assert_eq!(spent, U256::ZERO);
            assert!(!fx
                .manager
                .contract_set()
                .retrieve_metadata(&old.id)
                .unwrap()
                .status
                .canceled);
        }

        // Past the half window with three failures on record: canceled
        let (_, result) = fx
            .manager
            .contract_renew_start(&record, &rent, 951, 1000 + rent.period)
            .await;
        assert!(result.is_err());
        let meta = fx
            .manager
            .contract_set()
            .retrieve_metadata(&old.id)
            .unwrap();
        assert!(meta.status.canceled);
        assert!(!meta.status.renew_ability);
    }

    #[tokio::test]
    async fn budget_skips_unaffordable_renewals() {
        let fx = fixture(vec![]);
        let host = test_host(1);
        fx.host_pool.insert(host.clone()).unwrap();
        let rent = rent_with_window(100);
        fx.manager.set_rent_payment(rent.clone());

        let old = active_header(1, &host, 1000, 10_000, 10_000);
        fx.manager
            .contract_set()
            .insert_contract(old.clone(), vec![])
            .unwrap();

        let record = RenewRecord {
            id: old.id,
            cost: U256::from(500u64),
        };
        // Remaining fund below the record cost: the renewal is skipped, not
        // failed, and no session is ever opened (the connector has no script)
        let (remaining, terminate) = fx
            .manager
            .prepare_contract_renew(std::slice::from_ref(&record), U256::from(100u64))
            .await;
        assert_eq!(remaining, U256::from(100u64));
        assert!(!terminate);
        assert!(fx.manager.contract_set().contains(&old.id));
    }

    #[tokio::test]
    async fn reset_failed_renews_compacts_to_live_records() {
        let fx = fixture(vec![]);
        let live = ContractId::from_slice(&[1; 32]);
        let stale = ContractId::from_slice(&[2; 32]);
        {
            let mut state = fx.manager.state.write();
            state.failed_renew_count.insert(live, 2);
            state.failed_renew_count.insert(stale, 5);
        }
        let records = vec![RenewRecord {
            id: live,
            cost: U256::ZERO,
        }];
        fx.manager.reset_failed_renews(&records, &[]);
        let state = fx.manager.state.read();
        assert_eq!(state.failed_renew_count.get(&live), Some(&2));
        assert!(!state.failed_renew_count.contains_key(&stale));
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn settings_and_graph_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new());
        let pool = Arc::new(
            HostPoolManager::new(dir.path().join("pool"), Arc::new(NullProber)).unwrap(),
        );
        let a = ContractId::from_slice(&[1; 32]);
        let b = ContractId::from_slice(&[2; 32]);

        {
            let manager = ContractManager::new(
                dir.path().join("cm"),
                backend.clone(),
                Arc::new(ScriptedConnector::new(vec![])),
                Arc::new(MockWallet),
                pool.clone(),
                Address::repeat_byte(0xcc),
            )
            .unwrap();
            let mut state = manager.state.write();
            state.block_height = 777;
            state.current_period = 555;
            state.renewed_from.insert(b, a);
            state.renewed_to.insert(a, b);
            state
                .expired_contracts
                .insert(a, active_header(1, &test_host(1), 1000, 10_000, 10_000));
            drop(state);
            manager.close().unwrap();
        }

        let manager = ContractManager::new(
            dir.path().join("cm"),
            backend,
            Arc::new(ScriptedConnector::new(vec![])),
            Arc::new(MockWallet),
            pool,
            Address::repeat_byte(0xcc),
        )
        .unwrap();
        assert_eq!(manager.block_height(), 777);
        assert_eq!(manager.current_period(), 555);
        assert_eq!(manager.renewed_from(&b), Some(a));
        assert_eq!(manager.renewed_to(&a), Some(b));
        assert!(manager.expired_contract(&a).is_some());
        assert_eq!(manager.renewed_lineage(&a), vec![a, b]);
    }
}
