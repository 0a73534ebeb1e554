//! The persisted set of active contracts.
//!
//! Each contract lives in its own slot behind an exclusive async lock;
//! [`ContractSet::acquire`] hands out an owned guard and dropping the guard
//! is the return. A metadata cache mirrors every slot so enumeration never
//! waits on a contract somebody is revising.
//!
//! On disk each contract owns two files under `<dir>/contracts/`: a
//! `<id>.contract` header snapshot (rewritten through temp+rename) and a
//! `<id>.roots` file of 32-byte sector merkle roots that is only ever
//! appended to.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use alloy_primitives::{B256, U256};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use common::contracts::StorageContractRevision;
use common::{ContractId, ContractStatus, EnodeId};

/// Directory under the persist root holding the per-contract files.
pub const CONTRACTS_DIR: &str = "contracts";

/// File extension of the header snapshot.
pub const CONTRACT_EXT: &str = "contract";

/// File extension of the append-only merkle-root log.
pub const ROOTS_EXT: &str = "roots";

/// Everything the manager tracks about one contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractHeader {
    pub id: ContractId,
    pub enode_id: EnodeId,
    pub start_height: u64,
    pub end_height: u64,
    /// Total funding committed to this contract
    pub total_cost: U256,
    /// The host's one-off contract fee
    pub contract_fee: U256,
    pub latest_revision: StorageContractRevision,
    pub status: ContractStatus,
}

impl ContractHeader {
    /// The client's spendable balance under the latest revision.
    pub fn client_balance(&self) -> U256 {
        self.latest_revision.client_balance()
    }
}

struct ContractEntry {
    header: ContractHeader,
    merkle_roots: Vec<B256>,
    header_path: PathBuf,
    roots_path: PathBuf,
}

/// An exclusively held contract. Dropping the guard returns the contract.
pub struct AcquiredContract {
    guard: OwnedMutexGuard<ContractEntry>,
    set: Arc<SetInner>,
}

struct SetInner {
    slots: RwLock<HashMap<ContractId, Arc<Mutex<ContractEntry>>>>,
    meta_cache: RwLock<HashMap<ContractId, ContractHeader>>,
    dir: PathBuf,
}

/// The active-contract store.
#[derive(Clone)]
pub struct ContractSet {
    inner: Arc<SetInner>,
}

impl ContractSet {
    /// Open the store, loading every persisted contract under
    /// `<persist_dir>/contracts/`.
    pub fn open(persist_dir: &Path) -> io::Result<Self> {
        let dir = persist_dir.join(CONTRACTS_DIR);
        fs::create_dir_all(&dir)?;

        let mut slots = HashMap::new();
        let mut meta_cache = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(CONTRACT_EXT) {
                continue;
            }
            let data = fs::read(&path)?;
            let header: ContractHeader = match serde_json::from_slice(&data) {
                Ok(header) => header,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable contract file");
                    continue;
                }
            };
            let roots_path = path.with_extension(ROOTS_EXT);
            let merkle_roots = read_roots(&roots_path)?;
            meta_cache.insert(header.id, header.clone());
            slots.insert(
                header.id,
                Arc::new(Mutex::new(ContractEntry {
                    header,
                    merkle_roots,
                    header_path: path,
                    roots_path,
                })),
            );
        }

        Ok(Self {
            inner: Arc::new(SetInner {
                slots: RwLock::new(slots),
                meta_cache: RwLock::new(meta_cache),
                dir,
            }),
        })
    }

    /// Insert a freshly negotiated contract together with the merkle roots
    /// carried over from its predecessor (empty for a fresh create).
    pub fn insert_contract(
        &self,
        header: ContractHeader,
        merkle_roots: Vec<B256>,
    ) -> io::Result<ContractHeader> {
        let id = header.id;
        let header_path = self.inner.dir.join(format!("{}.{CONTRACT_EXT}", file_stem(&id)));
        let roots_path = header_path.with_extension(ROOTS_EXT);

        write_header(&header_path, &header)?;
        write_roots(&roots_path, &merkle_roots)?;

        self.inner.meta_cache.write().insert(id, header.clone());
        self.inner.slots.write().insert(
            id,
            Arc::new(Mutex::new(ContractEntry {
                header: header.clone(),
                merkle_roots,
                header_path,
                roots_path,
            })),
        );
        Ok(header)
    }

    /// Take the exclusive per-contract lock. `None` when the contract has
    /// left the set.
    pub async fn acquire(&self, id: &ContractId) -> Option<AcquiredContract> {
        let slot = self.inner.slots.read().get(id).cloned()?;
        let guard = slot.lock_owned().await;
        // The contract may have been deleted while we waited on the lock
        if !self.inner.slots.read().contains_key(id) {
            return None;
        }
        Some(AcquiredContract {
            guard,
            set: self.inner.clone(),
        })
    }

    /// Remove an acquired contract from the set and delete its files.
    pub fn delete(&self, acquired: AcquiredContract) -> io::Result<()> {
        let id = acquired.guard.header.id;
        self.inner.slots.write().remove(&id);
        self.inner.meta_cache.write().remove(&id);
        let header_path = acquired.guard.header_path.clone();
        let roots_path = acquired.guard.roots_path.clone();
        drop(acquired);
        fs::remove_file(header_path)?;
        match fs::remove_file(roots_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub fn contains(&self, id: &ContractId) -> bool {
        self.inner.slots.read().contains_key(id)
    }

    pub fn ids(&self) -> Vec<ContractId> {
        self.inner.slots.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.read().is_empty()
    }

    /// Snapshot of every contract's metadata, without touching any
    /// per-contract lock.
    pub fn metadatas(&self) -> Vec<ContractHeader> {
        self.inner.meta_cache.read().values().cloned().collect()
    }

    /// Cached metadata of one contract.
    pub fn retrieve_metadata(&self, id: &ContractId) -> Option<ContractHeader> {
        self.inner.meta_cache.read().get(id).cloned()
    }
}

impl AcquiredContract {
    pub fn id(&self) -> ContractId {
        self.guard.header.id
    }

    pub fn header(&self) -> &ContractHeader {
        &self.guard.header
    }

    pub fn metadata(&self) -> ContractHeader {
        self.guard.header.clone()
    }

    pub fn merkle_roots(&self) -> Vec<B256> {
        self.guard.merkle_roots.clone()
    }

    /// Replace the contract's status and persist the header.
    pub fn update_status(&mut self, status: ContractStatus) -> io::Result<()> {
        self.guard.header.status = status;
        self.persist_header()
    }

    /// Install a newer co-signed revision and persist the header.
    pub fn update_revision(&mut self, revision: StorageContractRevision) -> io::Result<()> {
        self.guard.header.latest_revision = revision;
        self.persist_header()
    }

    /// Append one sector root to the contract's root log.
    pub fn push_root(&mut self, root: B256) -> io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.guard.roots_path)?;
        file.write_all(root.as_slice())?;
        self.guard.merkle_roots.push(root);
        Ok(())
    }

    fn persist_header(&self) -> io::Result<()> {
        write_header(&self.guard.header_path, &self.guard.header)?;
        self.set
            .meta_cache
            .write()
            .insert(self.guard.header.id, self.guard.header.clone());
        Ok(())
    }
}

fn file_stem(id: &ContractId) -> String {
    hex::encode(id.as_bytes())
}

fn write_header(path: &Path, header: &ContractHeader) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(header)?)?;
    fs::rename(&tmp, path)
}

fn write_roots(path: &Path, roots: &[B256]) -> io::Result<()> {
    let mut data = Vec::with_capacity(roots.len() * 32);
    for root in roots {
        data.extend_from_slice(root.as_slice());
    }
    fs::write(path, data)
}

fn read_roots(path: &Path) -> io::Result<Vec<B256>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(data
        .chunks_exact(32)
        .map(B256::from_slice)
        .collect())
}
