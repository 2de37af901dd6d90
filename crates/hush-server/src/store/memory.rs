use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::info;

use super::model::SecretRecord;
use super::{SecretStore, StoreError};
use crate::cipher::Address;

/// Process-local store. Records are lost on restart.
///
/// The map lock is this backend's compare-and-swap primitive; it is held only
/// for the duration of a single operation.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<String, SecretRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl SecretStore for MemoryStore {
    fn get(&self, address: &Address) -> Result<Option<SecretRecord>, StoreError> {
        Ok(self.records.lock().get(address.as_str()).cloned())
    }

    fn create(&self, address: &Address, record: &SecretRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        if records.contains_key(address.as_str()) {
            return Err(StoreError::Occupied);
        }
        let mut stored = record.clone();
        stored.version = 0;
        records.insert(address.as_str().to_owned(), stored);
        Ok(())
    }

    fn compare_and_update(
        &self,
        address: &Address,
        expected_version: u64,
        record: &SecretRecord,
    ) -> Result<u64, StoreError> {
        let mut records = self.records.lock();
        match records.get_mut(address.as_str()) {
            Some(current) if current.version == expected_version => {
                let mut next = record.clone();
                next.version = expected_version + 1;
                *current = next;
                Ok(expected_version + 1)
            }
            _ => Err(StoreError::Conflict),
        }
    }

    fn delete(&self, address: &Address) -> Result<(), StoreError> {
        self.records.lock().remove(address.as_str());
        Ok(())
    }

    fn prune(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| !record.is_dead(now));
        let removed = before - records.len();
        if removed > 0 {
            info!(removed, "pruned dead secrets");
        }
        Ok(removed)
    }
}
