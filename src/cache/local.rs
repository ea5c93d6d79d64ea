//! Local availability cache: the source of truth consulted before any
//! upstream tier and populated by every answer an upstream tier gives.

use crate::cache::record::{AvailabilityRecord, FileEntry, FreshnessPolicy};
use crate::cache::store::AvailabilityStore;
use crate::catalog::{normalize_origin_tag, normalize_write_tag};
use crate::error::HeimdallError;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct LocalAvailabilityCache {
    store: Arc<dyn AvailabilityStore>,
    policy: FreshnessPolicy,
}

impl LocalAvailabilityCache {
    pub fn new(store: Arc<dyn AvailabilityStore>, policy: FreshnessPolicy) -> Self {
        Self { store, policy }
    }

    pub fn is_stale(&self, record: &AvailabilityRecord) -> bool {
        record.is_stale(&self.policy)
    }

    /// Return every stored record for `hashes`, stale or not. With a valid
    /// origin tag the file lists are scoped to that tag, and a cached record
    /// with no file visible to the tag is left out so the hash counts as a
    /// miss for that request.
    pub async fn lookup(
        &self,
        store_code: &str,
        hashes: &[String],
        origin_tag: &str,
    ) -> Result<HashMap<String, AvailabilityRecord>, HeimdallError> {
        if hashes.is_empty() {
            return Ok(HashMap::new());
        }

        let origin_tag = normalize_origin_tag(origin_tag);
        let records = self.store.get_many(store_code, hashes).await?;

        let by_hash: HashMap<String, AvailabilityRecord> = records
            .into_iter()
            .filter_map(|mut record| {
                if !origin_tag.is_empty() {
                    let visible: Vec<String> = record
                        .files_for(&origin_tag)
                        .into_iter()
                        .map(|f| f.name)
                        .collect();
                    record.files.retain(|f| visible.contains(&f.name));
                    if record.is_cached && record.files.is_empty() {
                        debug!(hash = %record.info_hash, origin_tag = %origin_tag, "No files for origin tag");
                        return None;
                    }
                }
                Some((record.info_hash.clone(), record))
            })
            .collect();

        debug!(
            store = store_code,
            requested = hashes.len(),
            found = by_hash.len(),
            "Local availability lookup"
        );

        Ok(by_hash)
    }

    /// Write a single observation. Empty `files` records a known miss.
    pub async fn upsert(
        &self,
        store_code: &str,
        hash: &str,
        files: Vec<FileEntry>,
        origin_tag: &str,
    ) -> Result<(), HeimdallError> {
        let origin_tag = normalize_write_tag(origin_tag);
        let record = build_record(store_code, hash, files, &origin_tag);
        self.store.put_many(vec![record]).await
    }

    /// Batched form of [`upsert`](Self::upsert), used for backfill.
    pub async fn bulk_upsert(
        &self,
        store_code: &str,
        files_by_hash: HashMap<String, Vec<FileEntry>>,
        origin_tag: &str,
    ) -> Result<(), HeimdallError> {
        if files_by_hash.is_empty() {
            return Ok(());
        }

        let origin_tag = normalize_write_tag(origin_tag);
        let records: Vec<AvailabilityRecord> = files_by_hash
            .into_iter()
            .map(|(hash, files)| build_record(store_code, &hash, files, &origin_tag))
            .collect();

        let hits = records.iter().filter(|r| r.is_cached).count();
        debug!(
            store = store_code,
            hits = hits,
            misses = records.len() - hits,
            "Bulk upserting availability records"
        );

        self.store.put_many(records).await
    }
}

fn build_record(
    store_code: &str,
    hash: &str,
    files: Vec<FileEntry>,
    origin_tag: &str,
) -> AvailabilityRecord {
    let files = files
        .into_iter()
        .map(|mut f| {
            if f.origin_tag.is_empty() {
                f.origin_tag = origin_tag.to_string();
            }
            f
        })
        .collect();
    AvailabilityRecord::observed(store_code, hash, files, origin_tag, Utc::now())
}
