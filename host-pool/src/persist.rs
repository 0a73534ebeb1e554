//! Host-pool settings snapshot.
//!
//! The pool persists everything it cannot relearn quickly (host records
//! with their scan history, the rent payment, the filter configuration and
//! the last seen block height) to `host.settings.json` under the persist
//! directory. Writes go through a temp file + rename so a crash mid-write
//! leaves the previous snapshot intact.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use common::{EnodeId, HostInfo, RentPayment};

use crate::FilterMode;

/// Snapshot file name under the persist directory.
pub const HOST_SETTINGS_FILE: &str = "host.settings.json";

/// Seconds between automatic snapshot saves.
pub const AUTO_SAVE_INTERVAL_SECS: u64 = 120;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostPoolSettings {
    pub rent: RentPayment,
    pub hosts: Vec<HostInfo>,
    pub filter_mode: FilterMode,
    pub filtered_hosts: Vec<EnodeId>,
    pub ip_violation_check: bool,
    pub block_height: u64,
}

/// Write the snapshot atomically.
pub fn save_settings(dir: &Path, settings: &HostPoolSettings) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let path = dir.join(HOST_SETTINGS_FILE);
    let tmp = dir.join(format!("{HOST_SETTINGS_FILE}.tmp"));
    let data = serde_json::to_vec_pretty(settings)?;
    fs::write(&tmp, data)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Load the snapshot; `None` when no snapshot exists yet.
pub fn load_settings(dir: &Path) -> io::Result<Option<HostPoolSettings>> {
    let path = dir.join(HOST_SETTINGS_FILE);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let settings = serde_json::from_slice(&data)?;
    Ok(Some(settings))
}
