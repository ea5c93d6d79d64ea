//! Sync bookkeeping for torrent metadata pulls and pushes, keyed by the
//! catalog root id.

use crate::cache::TtlCache;
use crate::catalog::root_id;
use crate::error::HeimdallError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const SYNC_CACHE_LIFETIME: Duration = Duration::from_secs(60 * 60);
const SYNC_CACHE_CAPACITY: usize = 8192;
pub const DEFAULT_SYNC_STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SyncInfoRecord {
    pub catalog_id: String,
    pub pulled_at: Option<DateTime<Utc>>,
    pub pushed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    Pull,
    Push,
}

impl SyncDirection {
    fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::Pull => "pull",
            SyncDirection::Push => "push",
        }
    }
}

pub trait SyncInfoStore: Send + Sync {
    fn get<'a>(
        &'a self,
        catalog_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<SyncInfoRecord>, HeimdallError>>;

    /// Set one timestamp, creating the row when missing.
    fn mark<'a>(
        &'a self,
        catalog_id: &'a str,
        direction: SyncDirection,
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), HeimdallError>>;
}

#[derive(Default)]
pub struct MemorySyncInfoStore {
    rows: DashMap<String, SyncInfoRecord>,
}

impl MemorySyncInfoStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncInfoStore for MemorySyncInfoStore {
    fn get<'a>(
        &'a self,
        catalog_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<SyncInfoRecord>, HeimdallError>> {
        let row = self.rows.get(catalog_id).map(|r| r.value().clone());
        futures::future::ready(Ok(row)).boxed()
    }

    fn mark<'a>(
        &'a self,
        catalog_id: &'a str,
        direction: SyncDirection,
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), HeimdallError>> {
        let mut row = self
            .rows
            .entry(catalog_id.to_string())
            .or_insert_with(|| SyncInfoRecord {
                catalog_id: catalog_id.to_string(),
                pulled_at: None,
                pushed_at: None,
            });
        match direction {
            SyncDirection::Pull => row.pulled_at = Some(at),
            SyncDirection::Push => row.pushed_at = Some(at),
        }
        futures::future::ready(Ok(())).boxed()
    }
}

/// Staleness gate over a [`SyncInfoStore`], memoized in-process so hot
/// catalog ids do not hit persistence on every request.
pub struct SyncInfo {
    store: Arc<dyn SyncInfoStore>,
    pulled: TtlCache<String, Option<DateTime<Utc>>>,
    pushed: TtlCache<String, Option<DateTime<Utc>>>,
    stale_after: Duration,
}

impl SyncInfo {
    pub fn new(store: Arc<dyn SyncInfoStore>) -> Self {
        Self::with_stale_after(store, DEFAULT_SYNC_STALE_AFTER)
    }

    pub fn with_stale_after(store: Arc<dyn SyncInfoStore>, stale_after: Duration) -> Self {
        Self {
            store,
            pulled: TtlCache::new("syncinfo:pull", SYNC_CACHE_LIFETIME, SYNC_CACHE_CAPACITY),
            pushed: TtlCache::new("syncinfo:push", SYNC_CACHE_LIFETIME, SYNC_CACHE_CAPACITY),
            stale_after,
        }
    }

    fn cache(&self, direction: SyncDirection) -> &TtlCache<String, Option<DateTime<Utc>>> {
        match direction {
            SyncDirection::Pull => &self.pulled,
            SyncDirection::Push => &self.pushed,
        }
    }

    async fn synced_at(
        &self,
        catalog_id: &str,
        direction: SyncDirection,
    ) -> Result<Option<DateTime<Utc>>, HeimdallError> {
        let root = root_id(catalog_id).to_string();
        if let Some(at) = self.cache(direction).get(&root) {
            return Ok(at);
        }

        let row = self.store.get(&root).await?;
        let at = row.and_then(|r| match direction {
            SyncDirection::Pull => r.pulled_at,
            SyncDirection::Push => r.pushed_at,
        });
        self.cache(direction).add(root, at);
        Ok(at)
    }

    fn is_due(&self, synced_at: Option<DateTime<Utc>>) -> bool {
        let Some(at) = synced_at else {
            return true;
        };
        match chrono::Duration::from_std(self.stale_after) {
            Ok(window) => Utc::now().signed_duration_since(at) > window,
            Err(_) => false,
        }
    }

    pub async fn should_pull(&self, catalog_id: &str) -> Result<bool, HeimdallError> {
        let at = self.synced_at(catalog_id, SyncDirection::Pull).await?;
        Ok(self.is_due(at))
    }

    pub async fn should_push(&self, catalog_id: &str) -> Result<bool, HeimdallError> {
        let at = self.synced_at(catalog_id, SyncDirection::Push).await?;
        Ok(self.is_due(at))
    }

    pub async fn mark_pulled(&self, catalog_id: &str) -> Result<(), HeimdallError> {
        self.mark(catalog_id, SyncDirection::Pull).await
    }

    pub async fn mark_pushed(&self, catalog_id: &str) -> Result<(), HeimdallError> {
        self.mark(catalog_id, SyncDirection::Push).await
    }

    async fn mark(&self, catalog_id: &str, direction: SyncDirection) -> Result<(), HeimdallError> {
        let root = root_id(catalog_id).to_string();
        let now = Utc::now();
        if let Err(e) = self.store.mark(&root, direction, now).await {
            self.cache(direction).remove(&root);
            return Err(e);
        }
        self.cache(direction).add(root.clone(), Some(now));
        debug!(catalog_id = %root, direction = direction.as_str(), "Marked synced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Counts reads so memoization can be observed.
    #[derive(Default)]
    struct CountingStore {
        inner: MemorySyncInfoStore,
        reads: AtomicUsize,
        fail_marks: AtomicBool,
    }

    impl SyncInfoStore for CountingStore {
        fn get<'a>(
            &'a self,
            catalog_id: &'a str,
        ) -> BoxFuture<'a, Result<Option<SyncInfoRecord>, HeimdallError>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get(catalog_id)
        }

        fn mark<'a>(
            &'a self,
            catalog_id: &'a str,
            direction: SyncDirection,
            at: DateTime<Utc>,
        ) -> BoxFuture<'a, Result<(), HeimdallError>> {
            if self.fail_marks.load(Ordering::SeqCst) {
                return futures::future::ready(Err(HeimdallError::Storage("down".into()))).boxed();
            }
            self.inner.mark(catalog_id, direction, at)
        }
    }

    #[tokio::test]
    async fn test_pull_gate_is_episode_insensitive() {
        let sync = SyncInfo::new(Arc::new(MemorySyncInfoStore::new()));
        assert!(sync.should_pull("tt1:1:1").await.unwrap());

        sync.mark_pulled("tt1:1:1").await.unwrap();
        assert!(!sync.should_pull("tt1").await.unwrap());
        assert!(!sync.should_pull("tt1:2:5").await.unwrap());
        assert!(sync.should_pull("tt2").await.unwrap());

        // pulling says nothing about pushing
        assert!(sync.should_push("tt1").await.unwrap());
    }

    #[tokio::test]
    async fn test_reads_are_memoized() {
        let store = Arc::new(CountingStore::default());
        let sync = SyncInfo::new(store.clone());

        sync.should_pull("tt1").await.unwrap();
        sync.should_pull("tt1:1:1").await.unwrap();
        sync.should_pull("tt1").await.unwrap();
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_sync_is_due_again() {
        let store = Arc::new(MemorySyncInfoStore::new());
        store
            .mark("tt1", SyncDirection::Push, Utc::now() - chrono::Duration::hours(2))
            .await
            .unwrap();

        let sync = SyncInfo::with_stale_after(store, Duration::from_secs(60 * 60));
        assert!(sync.should_push("tt1").await.unwrap());
        assert!(sync.should_pull("tt1").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_mark_drops_memoized_entry() {
        let store = Arc::new(CountingStore::default());
        let sync = SyncInfo::new(store.clone());

        assert!(sync.should_pull("tt1").await.unwrap());
        store.fail_marks.store(true, Ordering::SeqCst);
        assert!(sync.mark_pulled("tt1").await.is_err());

        assert!(sync.should_pull("tt1").await.unwrap());
        assert_eq!(store.reads.load(Ordering::SeqCst), 2);
    }
}
