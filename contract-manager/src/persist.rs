//! Contract-manager settings snapshot.
//!
//! `contract.settings.json` carries everything outside the per-contract
//! files: the rent payment, the current period and block height, the expired
//! table and the renewal lineage maps. Reloading must rebuild an identical
//! in-memory graph.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use common::{ContractId, RentPayment};

use crate::contract_set::ContractHeader;

/// Snapshot file name under the persist directory.
pub const CONTRACT_SETTINGS_FILE: &str = "contract.settings.json";

/// Seconds between automatic snapshot saves.
pub const AUTO_SAVE_INTERVAL_SECS: u64 = 120;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractSettings {
    pub rent_payment: Option<RentPayment>,
    pub current_period: u64,
    pub block_height: u64,
    pub expired_contracts: HashMap<ContractId, ContractHeader>,
    /// successor id → predecessor id
    pub renewed_from: HashMap<ContractId, ContractId>,
    /// predecessor id → successor id
    pub renewed_to: HashMap<ContractId, ContractId>,
}

/// Write the snapshot atomically.
pub fn save_settings(dir: &Path, settings: &ContractSettings) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let path = dir.join(CONTRACT_SETTINGS_FILE);
    let tmp = dir.join(format!("{CONTRACT_SETTINGS_FILE}.tmp"));
    fs::write(&tmp, serde_json::to_vec_pretty(settings)?)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Load the snapshot; `None` when no snapshot exists yet.
pub fn load_settings(dir: &Path) -> io::Result<Option<ContractSettings>> {
    let path = dir.join(CONTRACT_SETTINGS_FILE);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(Some(serde_json::from_slice(&data)?))
}
