//! Availability records: "as of time T, hash H on store S was cached with
//! these files, or a known miss".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

/// A file observed inside a cached torrent, with the origin tag of the
/// request context that observed it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub index: i32,
    pub name: String,
    pub size: i64,
    #[serde(default)]
    pub origin_tag: String,
}

impl FileEntry {
    pub fn to_cached_file(&self) -> CachedFile {
        CachedFile {
            index: self.index,
            name: self.name.clone(),
            size: self.size,
        }
    }
}

/// External shape of a file returned to callers (provenance stripped).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    pub index: i32,
    pub name: String,
    pub size: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityRecord {
    pub store_code: String,
    pub info_hash: String,
    pub is_cached: bool,
    pub files: Vec<FileEntry>,
    pub last_checked_at: DateTime<Utc>,
    #[serde(default)]
    pub origin_tag: String,
}

impl AvailabilityRecord {
    /// Build a record from an observation. An empty file list is a known miss.
    pub fn observed(
        store_code: &str,
        info_hash: &str,
        files: Vec<FileEntry>,
        origin_tag: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let files = dedupe_files(info_hash, files);
        Self {
            store_code: store_code.to_string(),
            info_hash: info_hash.to_string(),
            is_cached: !files.is_empty(),
            files,
            last_checked_at: now,
            origin_tag: origin_tag.to_string(),
        }
    }

    pub fn is_stale(&self, policy: &FreshnessPolicy) -> bool {
        self.is_stale_at(policy, Utc::now())
    }

    pub fn is_stale_at(&self, policy: &FreshnessPolicy, now: DateTime<Utc>) -> bool {
        let window = policy.window_for(self.is_cached);
        let age = now.signed_duration_since(self.last_checked_at);
        match chrono::Duration::from_std(window) {
            Ok(window) => age > window,
            Err(_) => false,
        }
    }

    /// Files visible to a request scoped by `origin_tag`. The empty tag sees
    /// everything; a concrete tag sees its own files plus untagged and
    /// wildcard ones.
    pub fn files_for(&self, origin_tag: &str) -> Vec<CachedFile> {
        self.files
            .iter()
            .filter(|f| {
                origin_tag.is_empty()
                    || f.origin_tag.is_empty()
                    || f.origin_tag == crate::catalog::WILDCARD_ORIGIN_TAG
                    || f.origin_tag == origin_tag
            })
            .map(FileEntry::to_cached_file)
            .collect()
    }
}

/// How long a record stays fresh, separately for hits and known misses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub cached: Duration,
    pub uncached: Duration,
}

impl FreshnessPolicy {
    /// Same window for hits and misses
    pub fn uniform(window: Duration) -> Self {
        Self {
            cached: window,
            uncached: window,
        }
    }

    pub fn window_for(&self, is_cached: bool) -> Duration {
        if is_cached {
            self.cached
        } else {
            self.uncached
        }
    }
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            cached: Duration::from_secs(12 * 60 * 60),
            uncached: Duration::from_secs(60 * 60),
        }
    }
}

/// Collapse files with the same name to their first occurrence.
pub fn dedupe_files(info_hash: &str, files: Vec<FileEntry>) -> Vec<FileEntry> {
    let mut seen: HashSet<String> = HashSet::with_capacity(files.len());
    let mut out = Vec::with_capacity(files.len());

    for file in files {
        if !seen.insert(file.name.clone()) {
            debug!(hash = info_hash, filename = %file.name, "Found duplicate file");
            continue;
        }
        out.push(file);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(index: i32, name: &str, tag: &str) -> FileEntry {
        FileEntry {
            index,
            name: name.to_string(),
            size: 1024,
            origin_tag: tag.to_string(),
        }
    }

    #[test]
    fn test_dedupe_keeps_first() {
        let files = vec![file(0, "a", ""), file(1, "a", ""), file(2, "b", "")];
        let deduped = dedupe_files("h", files);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].index, 0);
        assert_eq!(deduped[1].name, "b");
    }

    #[test]
    fn test_empty_files_is_known_miss() {
        let record = AvailabilityRecord::observed("rd", "h", vec![], "", Utc::now());
        assert!(!record.is_cached);

        let record = AvailabilityRecord::observed("rd", "h", vec![file(0, "a", "")], "", Utc::now());
        assert!(record.is_cached);
    }

    #[test]
    fn test_freshness_gate() {
        let window = Duration::from_secs(600);
        let policy = FreshnessPolicy::uniform(window);
        let t0 = Utc::now();
        let record = AvailabilityRecord::observed("rd", "h", vec![file(0, "a", "")], "", t0);

        let epsilon = chrono::Duration::seconds(1);
        let window = chrono::Duration::from_std(window).unwrap();
        assert!(!record.is_stale_at(&policy, t0 + window - epsilon));
        assert!(record.is_stale_at(&policy, t0 + window + epsilon));
    }

    #[test]
    fn test_misses_use_uncached_window() {
        let policy = FreshnessPolicy {
            cached: Duration::from_secs(3600),
            uncached: Duration::from_secs(60),
        };
        let t0 = Utc::now();
        let miss = AvailabilityRecord::observed("rd", "h", vec![], "", t0);
        let hit = AvailabilityRecord::observed("rd", "h", vec![file(0, "a", "")], "", t0);

        let later = t0 + chrono::Duration::seconds(120);
        assert!(miss.is_stale_at(&policy, later));
        assert!(!hit.is_stale_at(&policy, later));
    }

    #[test]
    fn test_files_scoped_by_origin_tag() {
        let record = AvailabilityRecord::observed(
            "rd",
            "h",
            vec![
                file(0, "s01e01.mkv", "tt1:1:1"),
                file(1, "s01e02.mkv", "tt1:1:2"),
                file(2, "sample.mkv", "*"),
                file(3, "extras.mkv", ""),
            ],
            "*",
            Utc::now(),
        );

        assert_eq!(record.files_for("").len(), 4);

        let scoped: Vec<String> = record
            .files_for("tt1:1:1")
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(scoped, vec!["s01e01.mkv", "sample.mkv", "extras.mkv"]);
    }
}
