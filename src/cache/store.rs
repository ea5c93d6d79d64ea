//! Persistence seam for availability records.

use crate::cache::record::AvailabilityRecord;
use crate::error::HeimdallError;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;

/// Record persistence keyed by `(store_code, info_hash)`. Writes are full
/// record replaces, so concurrent writers need no coordination.
pub trait AvailabilityStore: Send + Sync {
    fn get_many<'a>(
        &'a self,
        store_code: &'a str,
        hashes: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<AvailabilityRecord>, HeimdallError>>;

    fn put_many(&self, records: Vec<AvailabilityRecord>) -> BoxFuture<'_, Result<(), HeimdallError>>;
}

/// In-process availability store; persisted with the disk snapshot.
#[derive(Default)]
pub struct MemoryAvailabilityStore {
    records: DashMap<(String, String), AvailabilityRecord>,
}

impl MemoryAvailabilityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<AvailabilityRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    fn insert(&self, record: AvailabilityRecord) {
        let key = (record.store_code.clone(), record.info_hash.clone());
        self.records.insert(key, record);
    }

    /// Copy of every record, for snapshotting
    pub fn all_records(&self) -> Vec<AvailabilityRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl AvailabilityStore for MemoryAvailabilityStore {
    fn get_many<'a>(
        &'a self,
        store_code: &'a str,
        hashes: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<AvailabilityRecord>, HeimdallError>> {
        let found = hashes
            .iter()
            .filter_map(|hash| {
                self.records
                    .get(&(store_code.to_string(), hash.clone()))
                    .map(|r| r.value().clone())
            })
            .collect();
        futures::future::ready(Ok(found)).boxed()
    }

    fn put_many(&self, records: Vec<AvailabilityRecord>) -> BoxFuture<'_, Result<(), HeimdallError>> {
        for record in records {
            self.insert(record);
        }
        futures::future::ready(Ok(())).boxed()
    }
}
