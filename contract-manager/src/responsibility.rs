//! Storage-responsibility records.
//!
//! Each on-chain contract obliges this node to keep data around until the
//! proof window closes. Records live in a small embedded DB keyed by
//! contract id, with a secondary index from expiration block height to the
//! contract ids due at that height, so the expiry sweep reads one key per
//! block.

use alloy_primitives::B256;
use alloy_rlp::{Decodable, RlpDecodable, RlpEncodable};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;

use common::ContractId;

const RESPONSIBILITY_TABLE: TableDefinition<&[u8; 32], &[u8]> =
    TableDefinition::new("storage_responsibility");
const HEIGHT_TABLE: TableDefinition<u64, &[u8]> =
    TableDefinition::new("storage_responsibility_height");

/// One responsibility record, RLP-encoded at rest.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct StorageResponsibility {
    pub contract_id: ContractId,
    /// Size of the data committed under this contract
    pub data_size: u64,
    /// Merkle root the proof must open against
    pub merkle_root: B256,
    /// Block height at which the proof window closes
    pub expiration_height: u64,
}

/// The responsibility store.
pub struct ResponsibilityDb {
    db: Database,
}

impl ResponsibilityDb {
    /// Open or create the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, redb::Error> {
        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(RESPONSIBILITY_TABLE)?;
            let _ = write_txn.open_table(HEIGHT_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Store a record and index it under its expiration height.
    pub fn put(&self, responsibility: &StorageResponsibility) -> Result<(), redb::Error> {
        let encoded = alloy_rlp::encode(responsibility);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(RESPONSIBILITY_TABLE)?;
            table.insert(responsibility.contract_id.as_bytes(), encoded.as_slice())?;

            let mut heights = write_txn.open_table(HEIGHT_TABLE)?;
            let mut ids = heights
                .get(responsibility.expiration_height)?
                .map(|v| v.value().to_vec())
                .unwrap_or_default();
            if !ids
                .chunks_exact(32)
                .any(|c| c == responsibility.contract_id.as_bytes())
            {
                ids.extend_from_slice(responsibility.contract_id.as_bytes());
            }
            heights.insert(responsibility.expiration_height, ids.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Fetch a record by contract id.
    pub fn get(&self, id: &ContractId) -> Result<Option<StorageResponsibility>, redb::Error> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(RESPONSIBILITY_TABLE)?;
        let Some(raw) = table.get(id.as_bytes())? else {
            return Ok(None);
        };
        Ok(StorageResponsibility::decode(&mut raw.value()).ok())
    }

    /// Delete a record (its height index entry is cleared by the sweep).
    pub fn delete(&self, id: &ContractId) -> Result<(), redb::Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(RESPONSIBILITY_TABLE)?;
            table.remove(id.as_bytes())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Contract ids whose proof window closes at this height.
    pub fn contract_ids_at_height(&self, height: u64) -> Result<Vec<ContractId>, redb::Error> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(HEIGHT_TABLE)?;
        let Some(raw) = table.get(height)? else {
            return Ok(Vec::new());
        };
        Ok(raw
            .value()
            .chunks_exact(32)
            .map(ContractId::from_slice)
            .collect())
    }

    /// Drop the height index entry once the sweep has handled it.
    pub fn delete_height(&self, height: u64) -> Result<(), redb::Error> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(HEIGHT_TABLE)?;
            table.remove(height)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
