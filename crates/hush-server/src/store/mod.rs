pub mod db;
pub mod memory;
pub mod model;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::cipher::Address;

pub use db::RedbStore;
pub use memory::MemoryStore;
pub use model::{SecretRecord, SecretState};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The caller's observed version is stale, or the record vanished.
    #[error("version conflict")]
    Conflict,
    /// `create` found a record already living at the address.
    #[error("address already holds a secret")]
    Occupied,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Versioned persistence for secret records.
///
/// Every mutation after `create` goes through `compare_and_update`, which must
/// be linearizable in the backend itself: engine instances share nothing but
/// the store.
pub trait SecretStore: Send + Sync {
    /// Fetch the record with its current version, or `None` if absent.
    fn get(&self, address: &Address) -> Result<Option<SecretRecord>, StoreError>;

    /// Persist payload and version 0 as one unit. Never overwrites.
    fn create(&self, address: &Address, record: &SecretRecord) -> Result<(), StoreError>;

    /// Replace the payload if the stored version equals `expected_version`,
    /// bumping the version by one. Returns the new version.
    fn compare_and_update(
        &self,
        address: &Address,
        expected_version: u64,
        record: &SecretRecord,
    ) -> Result<u64, StoreError>;

    /// Remove payload and version. Absence is not an error.
    fn delete(&self, address: &Address) -> Result<(), StoreError>;

    /// Remove every record dead at `now`. Returns how many were removed.
    fn prune(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}
