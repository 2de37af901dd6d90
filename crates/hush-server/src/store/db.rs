use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{debug, info, warn};

use super::model::SecretRecord;
use super::{SecretStore, StoreError};
use crate::cipher::Address;

const SECRETS: TableDefinition<&str, &[u8]> = TableDefinition::new("secrets");
const VERSIONS: TableDefinition<&str, u64> = TableDefinition::new("secret_versions");

/// Leading byte of every stored payload, so the layout can evolve.
const RECORD_FORMAT: u8 = 0x01;

macro_rules! unavailable_from {
    ($($err:ty),* $(,)?) => {
        $(
            impl From<$err> for StoreError {
                fn from(e: $err) -> Self {
                    StoreError::Unavailable(e.to_string())
                }
            }
        )*
    };
}

unavailable_from!(
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// redb-backed store. redb admits one write transaction at a time, which is
/// what makes `compare_and_update` atomic. The file lock confines it to a
/// single process.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Ensure all tables exist.
        let write_txn = db.begin_write()?;
        write_txn.open_table(SECRETS)?;
        write_txn.open_table(VERSIONS)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl SecretStore for RedbStore {
    fn get(&self, address: &Address) -> Result<Option<SecretRecord>, StoreError> {
        let key = address.as_str();
        let read_txn = self.db.begin_read()?;
        let secrets = read_txn.open_table(SECRETS)?;
        let versions = read_txn.open_table(VERSIONS)?;

        let payload: Option<Vec<u8>> = secrets.get(key)?.map(|guard| guard.value().to_vec());
        let version: Option<u64> = versions.get(key)?.map(|guard| guard.value());

        match (payload, version) {
            (Some(bytes), Some(version)) => {
                let mut record = decode(&bytes)?;
                record.version = version;
                Ok(Some(record))
            }
            (None, None) => Ok(None),
            _ => Err(StoreError::Unavailable(
                "payload and version out of step".into(),
            )),
        }
    }

    fn create(&self, address: &Address, record: &SecretRecord) -> Result<(), StoreError> {
        let key = address.as_str();
        let bytes = encode(record)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut versions = write_txn.open_table(VERSIONS)?;
            if versions.get(key)?.is_some() {
                return Err(StoreError::Occupied);
            }
            let mut secrets = write_txn.open_table(SECRETS)?;
            secrets.insert(key, bytes.as_slice())?;
            versions.insert(key, 0u64)?;
        }
        write_txn.commit()?;

        debug!("stored secret");
        Ok(())
    }

    fn compare_and_update(
        &self,
        address: &Address,
        expected_version: u64,
        record: &SecretRecord,
    ) -> Result<u64, StoreError> {
        let key = address.as_str();
        let bytes = encode(record)?;

        let write_txn = self.db.begin_write()?;
        let next = {
            let mut versions = write_txn.open_table(VERSIONS)?;
            let current: Option<u64> = versions.get(key)?.map(|guard| guard.value());
            if current != Some(expected_version) {
                return Err(StoreError::Conflict);
            }

            let next = expected_version + 1;
            let mut secrets = write_txn.open_table(SECRETS)?;
            secrets.insert(key, bytes.as_slice())?;
            versions.insert(key, next)?;
            next
        };
        write_txn.commit()?;
        Ok(next)
    }

    fn delete(&self, address: &Address) -> Result<(), StoreError> {
        let key = address.as_str();
        let write_txn = self.db.begin_write()?;
        {
            let mut secrets = write_txn.open_table(SECRETS)?;
            secrets.remove(key)?;
            let mut versions = write_txn.open_table(VERSIONS)?;
            versions.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn prune(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut secrets = write_txn.open_table(SECRETS)?;
            let mut versions = write_txn.open_table(VERSIONS)?;

            // A row that fails to decode is left in place; it must not stall
            // the rest of the sweep.
            let mut dead: Vec<String> = Vec::new();
            let mut unreadable = 0usize;
            for item in secrets.iter()? {
                let (k, v) = item?;
                match decode(v.value()) {
                    Ok(record) if record.is_dead(now) => dead.push(k.value().to_owned()),
                    Ok(_) => {}
                    Err(e) => {
                        unreadable += 1;
                        debug!(error = %e, "skipping undecodable record");
                    }
                }
            }
            if unreadable > 0 {
                warn!(unreadable, "prune skipped records it could not decode");
            }

            for key in &dead {
                secrets.remove(key.as_str())?;
                versions.remove(key.as_str())?;
            }
            dead.len()
        };
        write_txn.commit()?;

        if removed > 0 {
            info!(removed, "pruned dead secrets");
        }
        Ok(removed)
    }
}

/// `[RECORD_FORMAT] + bincode(record)`. The version is not part of the payload.
fn encode(record: &SecretRecord) -> Result<Vec<u8>, StoreError> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| StoreError::Unavailable(format!("bincode encode: {e}")))?;
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(RECORD_FORMAT);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<SecretRecord, StoreError> {
    match bytes.split_first() {
        Some((&RECORD_FORMAT, payload)) => {
            let (record, _) =
                bincode::serde::decode_from_slice(payload, bincode::config::standard())
                    .map_err(|e| StoreError::Unavailable(format!("bincode decode: {e}")))?;
            Ok(record)
        }
        Some((marker, _)) => Err(StoreError::Unavailable(format!(
            "unknown record format {marker:#04x}"
        ))),
        None => Err(StoreError::Unavailable("empty record".into())),
    }
}
