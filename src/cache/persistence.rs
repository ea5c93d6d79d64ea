//! Disk persistence for the in-memory availability store.
//!
//! Saves and loads every availability record with integrity checking via
//! checksums, so a restart does not throw away what the cascade learned.

use crate::cache::record::AvailabilityRecord;
use crate::error::HeimdallError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

/// Version of the disk cache format
const CACHE_VERSION: u32 = 1;

/// Disk cache format with metadata and integrity check
#[derive(Serialize, Deserialize)]
pub struct DiskCache {
    /// Schema version for forward compatibility
    pub version: u32,
    /// When this cache was created
    pub created_at: DateTime<Utc>,
    /// SHA256 checksum of serialized records
    pub checksum: String,
    /// Number of records (for quick validation)
    pub record_count: usize,
    pub records: Vec<AvailabilityRecord>,
}

impl DiskCache {
    pub fn new(records: Vec<AvailabilityRecord>) -> Result<Self, HeimdallError> {
        let record_count = records.len();
        let checksum = checksum_records(&records)?;

        Ok(Self {
            version: CACHE_VERSION,
            created_at: Utc::now(),
            checksum,
            record_count,
            records,
        })
    }

    pub fn validate(&self) -> Result<(), HeimdallError> {
        if self.version > CACHE_VERSION {
            return Err(HeimdallError::Cache(format!(
                "Cache version {} is newer than supported version {}",
                self.version, CACHE_VERSION
            )));
        }

        if self.records.len() != self.record_count {
            return Err(HeimdallError::Cache(format!(
                "Record count mismatch: expected {}, got {}",
                self.record_count,
                self.records.len()
            )));
        }

        if checksum_records(&self.records)? != self.checksum {
            return Err(HeimdallError::Cache(
                "Checksum mismatch - cache may be corrupt".to_string(),
            ));
        }

        Ok(())
    }
}

fn checksum_records(records: &[AvailabilityRecord]) -> Result<String, HeimdallError> {
    let bytes = rmp_serde::to_vec(records)
        .map_err(|e| HeimdallError::Cache(format!("Failed to serialize records: {}", e)))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// Load availability records from disk
pub async fn load_from_disk(path: &Path) -> Result<Vec<AvailabilityRecord>, HeimdallError> {
    info!(path = %path.display(), "Loading availability cache from disk");

    let bytes = fs::read(path)
        .await
        .map_err(|e| HeimdallError::Cache(format!("Failed to read cache file: {}", e)))?;

    debug!(bytes = bytes.len(), "Read cache file");

    let cache: DiskCache = rmp_serde::from_slice(&bytes)
        .map_err(|e| HeimdallError::Cache(format!("Failed to deserialize cache: {}", e)))?;

    info!(
        version = cache.version,
        records = cache.record_count,
        created_at = %cache.created_at,
        "Loaded disk cache metadata"
    );

    cache.validate()?;

    Ok(cache.records)
}

/// Save availability records to disk
pub async fn persist_to_disk(
    records: Vec<AvailabilityRecord>,
    path: &Path,
) -> Result<(), HeimdallError> {
    let cache = DiskCache::new(records)?;

    let bytes = rmp_serde::to_vec(&cache)
        .map_err(|e| HeimdallError::Cache(format!("Failed to serialize cache: {}", e)))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| HeimdallError::Cache(format!("Failed to create cache directory: {}", e)))?;
    }

    // Atomic write: write to temp file, then rename
    let temp_path = path.with_extension("tmp");

    fs::write(&temp_path, &bytes)
        .await
        .map_err(|e| HeimdallError::Cache(format!("Failed to write temp cache file: {}", e)))?;

    fs::rename(&temp_path, path)
        .await
        .map_err(|e| HeimdallError::Cache(format!("Failed to rename cache file: {}", e)))?;

    info!(
        path = %path.display(),
        records = cache.record_count,
        bytes = bytes.len(),
        "Availability cache persisted"
    );

    Ok(())
}
