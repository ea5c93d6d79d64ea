//! Write-back tracker: records observations made after playback or a direct
//! store check.
//!
//! The local cache write always happens first and is the only step whose
//! failure reaches the caller. The buddy report is awaited; the peer report
//! is detached.

use crate::cache::record::{CachedFile, FileEntry};
use crate::cache::LocalAvailabilityCache;
use crate::cascade::background::BackgroundTasks;
use crate::catalog::{normalize_write_tag, WILDCARD_ORIGIN_TAG};
use crate::error::HeimdallError;
use crate::magnet::MagnetLink;
use crate::metrics::SharedMetrics;
use crate::upstream::{BuddyApi, PeerApi, TrackMagnetParams};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct WriteBackTracker {
    local: LocalAvailabilityCache,
    buddy: Option<Arc<dyn BuddyApi>>,
    /// Set only when a peer and a peer auth token are configured.
    peer: Option<Arc<dyn PeerApi>>,
    tasks: BackgroundTasks,
    metrics: SharedMetrics,
}

impl WriteBackTracker {
    pub fn new(
        local: LocalAvailabilityCache,
        buddy: Option<Arc<dyn BuddyApi>>,
        peer: Option<Arc<dyn PeerApi>>,
        tasks: BackgroundTasks,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            local,
            buddy,
            peer,
            tasks,
            metrics,
        }
    }

    /// Record one observation. An invalid hash is rejected before anything
    /// is written.
    pub async fn track(&self, params: TrackMagnetParams) -> Result<(), HeimdallError> {
        let magnet = MagnetLink::parse(&params.hash)
            .map_err(|e| HeimdallError::BadRequest(e.to_string()))?;

        let params = TrackMagnetParams {
            hash: magnet.hash,
            files: if params.is_miss { Vec::new() } else { params.files },
            origin_tag: normalize_write_tag(&params.origin_tag),
            ..params
        };

        let files: Vec<FileEntry> = params.files.iter().map(to_file_entry).collect();
        self.local
            .upsert(&params.store_code, &params.hash, files, &params.origin_tag)
            .await?;
        self.metrics.record_track("local", "success");

        if let Some(buddy) = &self.buddy {
            let start = Instant::now();
            match buddy.track_magnet(&params).await {
                Ok(()) => {
                    debug!(
                        store = %params.store_code,
                        hash = %params.hash,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Tracked magnet cache on buddy"
                    );
                    self.metrics.record_track("buddy", "success");
                }
                Err(e) => {
                    warn!(
                        store = %params.store_code,
                        hash = %params.hash,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        error = %e,
                        "Failed to track magnet cache on buddy"
                    );
                    self.metrics.record_track("buddy", "error");
                }
            }
        }

        if let Some(peer) = &self.peer {
            let peer = peer.clone();
            let metrics = self.metrics.clone();
            self.tasks.spawn("peer_track", async move {
                report_to_peer(peer.as_ref(), &metrics, &params).await;
                Ok(())
            });
        }

        Ok(())
    }

    /// Batched form of [`track`](Self::track) for store-wide refreshes that
    /// have no catalog context. Invalid hashes are dropped.
    pub async fn bulk_track(
        &self,
        store_code: &str,
        files_by_hash: HashMap<String, Vec<CachedFile>>,
        store_token: &str,
    ) -> Result<(), HeimdallError> {
        let files_by_hash: HashMap<String, Vec<CachedFile>> = files_by_hash
            .into_iter()
            .filter_map(|(hash, files)| match MagnetLink::parse(&hash) {
                Ok(magnet) => Some((magnet.hash, files)),
                Err(e) => {
                    debug!(hash = %hash, error = %e, "Dropping invalid hash from bulk track");
                    None
                }
            })
            .collect();

        if files_by_hash.is_empty() {
            return Ok(());
        }

        let entries: HashMap<String, Vec<FileEntry>> = files_by_hash
            .iter()
            .map(|(hash, files)| (hash.clone(), files.iter().map(to_file_entry).collect()))
            .collect();
        self.local
            .bulk_upsert(store_code, entries, WILDCARD_ORIGIN_TAG)
            .await?;
        self.metrics.record_track("local", "success");

        if let Some(buddy) = &self.buddy {
            let start = Instant::now();
            match buddy.bulk_track_magnets(store_code, &files_by_hash).await {
                Ok(()) => {
                    debug!(
                        store = store_code,
                        hash_count = files_by_hash.len(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Bulk tracked magnet cache on buddy"
                    );
                    self.metrics.record_track("buddy", "success");
                }
                Err(e) => {
                    warn!(
                        store = store_code,
                        hash_count = files_by_hash.len(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        error = %e,
                        "Failed to bulk track magnet cache on buddy"
                    );
                    self.metrics.record_track("buddy", "error");
                }
            }
        }

        if let Some(peer) = &self.peer {
            // the peer has no bulk endpoint
            let peer = peer.clone();
            let metrics = self.metrics.clone();
            let store_code = store_code.to_string();
            let store_token = store_token.to_string();
            self.tasks.spawn("peer_bulk_track", async move {
                for (hash, files) in files_by_hash {
                    let params = TrackMagnetParams {
                        store_code: store_code.clone(),
                        is_miss: files.is_empty(),
                        hash,
                        files,
                        origin_tag: String::new(),
                        store_token: store_token.clone(),
                    };
                    report_to_peer(peer.as_ref(), &metrics, &params).await;
                }
                Ok(())
            });
        }

        Ok(())
    }
}

async fn report_to_peer(peer: &dyn PeerApi, metrics: &SharedMetrics, params: &TrackMagnetParams) {
    let start = Instant::now();
    match peer.track_magnet(params).await {
        Ok(()) => {
            info!(
                store = %params.store_code,
                hash = %params.hash,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Tracked magnet cache on peer"
            );
            metrics.record_track("peer", "success");
        }
        Err(e) => {
            warn!(
                store = %params.store_code,
                hash = %params.hash,
                elapsed_ms = start.elapsed().as_millis() as u64,
                error = %e,
                "Failed to track magnet cache on peer"
            );
            metrics.record_track("peer", "error");
        }
    }
}

fn to_file_entry(file: &CachedFile) -> FileEntry {
    FileEntry {
        index: file.index,
        name: file.name.clone(),
        size: file.size,
        origin_tag: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::record::FreshnessPolicy;
    use crate::cache::store::MemoryAvailabilityStore;
    use crate::cascade::tests::{BrokenStore, FakeUpstream, H1, H2};
    use crate::metrics::create_metrics;
    use std::sync::atomic::Ordering;

    fn cached(name: &str) -> CachedFile {
        CachedFile {
            index: 0,
            name: name.to_string(),
            size: 10,
        }
    }

    fn tracker(
        store: Arc<MemoryAvailabilityStore>,
        buddy: Option<Arc<FakeUpstream>>,
        peer: Option<Arc<FakeUpstream>>,
        tasks: BackgroundTasks,
    ) -> WriteBackTracker {
        WriteBackTracker::new(
            LocalAvailabilityCache::new(store, FreshnessPolicy::default()),
            buddy.map(|b| b as Arc<dyn BuddyApi>),
            peer.map(|p| p as Arc<dyn PeerApi>),
            tasks,
            create_metrics(),
        )
    }

    fn params(hash: &str, files: Vec<CachedFile>, is_miss: bool) -> TrackMagnetParams {
        TrackMagnetParams {
            store_code: "rd".to_string(),
            hash: hash.to_string(),
            files,
            is_miss,
            origin_tag: "tt0111161".to_string(),
            store_token: "token".to_string(),
        }
    }

    #[tokio::test]
    async fn test_track_writes_local_then_reports() {
        let store = Arc::new(MemoryAvailabilityStore::new());
        let buddy = Arc::new(FakeUpstream::default());
        let peer = Arc::new(FakeUpstream::default());
        let tasks = BackgroundTasks::new(8);
        let tracker = tracker(store.clone(), Some(buddy.clone()), Some(peer.clone()), tasks.clone());

        tracker
            .track(params(&H1.to_uppercase(), vec![cached("movie.mkv")], false))
            .await
            .unwrap();

        // buddy is reported before track returns
        assert_eq!(buddy.tracks.load(Ordering::SeqCst), 1);
        assert_eq!(buddy.tracked.lock().unwrap()[0].hash, H1);

        tasks.drain().await;
        assert_eq!(peer.tracks.load(Ordering::SeqCst), 1);

        let records = store.all_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].info_hash, H1);
        assert!(records[0].is_cached);
        assert_eq!(records[0].files[0].origin_tag, "tt0111161");
    }

    #[tokio::test]
    async fn test_miss_is_recorded_without_files() {
        let store = Arc::new(MemoryAvailabilityStore::new());
        let buddy = Arc::new(FakeUpstream::default());
        let tracker = tracker(store.clone(), Some(buddy.clone()), None, BackgroundTasks::new(8));

        tracker
            .track(params(H1, vec![cached("ignored.mkv")], true))
            .await
            .unwrap();

        let records = store.all_records();
        assert!(!records[0].is_cached);
        assert!(records[0].files.is_empty());
        let reported = buddy.tracked.lock().unwrap()[0].clone();
        assert!(reported.is_miss);
        assert!(reported.files.is_empty());
    }

    #[tokio::test]
    async fn test_upstream_failures_are_swallowed() {
        let store = Arc::new(MemoryAvailabilityStore::new());
        let tasks = BackgroundTasks::new(8);
        let tracker = tracker(
            store.clone(),
            Some(Arc::new(FakeUpstream::failing())),
            Some(Arc::new(FakeUpstream::failing())),
            tasks.clone(),
        );

        tracker
            .track(params(H1, vec![cached("a")], false))
            .await
            .unwrap();
        tasks.drain().await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_hash_is_rejected() {
        let store = Arc::new(MemoryAvailabilityStore::new());
        let buddy = Arc::new(FakeUpstream::default());
        let tracker = tracker(store.clone(), Some(buddy.clone()), None, BackgroundTasks::new(8));

        let err = tracker.track(params("???", vec![], true)).await.unwrap_err();
        assert!(matches!(err, HeimdallError::BadRequest(_)));
        assert!(store.is_empty());
        assert_eq!(buddy.tracks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bulk_track() {
        let store = Arc::new(MemoryAvailabilityStore::new());
        let buddy = Arc::new(FakeUpstream::default());
        let peer = Arc::new(FakeUpstream::default());
        let tasks = BackgroundTasks::new(8);
        let tracker = tracker(store.clone(), Some(buddy.clone()), Some(peer.clone()), tasks.clone());

        let mut files_by_hash = HashMap::new();
        files_by_hash.insert(H1.to_string(), vec![cached("a"), cached("a")]);
        files_by_hash.insert(H2.to_string(), vec![]);
        files_by_hash.insert("bogus hash".to_string(), vec![cached("b")]);

        tracker.bulk_track("rd", files_by_hash, "token").await.unwrap();
        assert_eq!(buddy.bulk_tracks.load(Ordering::SeqCst), 1);

        tasks.drain().await;
        assert_eq!(peer.tracks.load(Ordering::SeqCst), 2);

        let mut records = store.all_records();
        records.sort_by(|a, b| a.info_hash.cmp(&b.info_hash));
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].info_hash, H2);
        assert!(!records[0].is_cached);
        assert_eq!(records[1].files.len(), 1);
        assert_eq!(records[1].origin_tag, WILDCARD_ORIGIN_TAG);
    }

    #[tokio::test]
    async fn test_local_write_failure_stops_reporting() {
        let buddy = Arc::new(FakeUpstream::default());
        let peer = Arc::new(FakeUpstream::default());
        let tasks = BackgroundTasks::new(8);
        let tracker = WriteBackTracker::new(
            LocalAvailabilityCache::new(Arc::new(BrokenStore), FreshnessPolicy::default()),
            Some(buddy.clone() as Arc<dyn BuddyApi>),
            Some(peer.clone() as Arc<dyn PeerApi>),
            tasks.clone(),
            create_metrics(),
        );

        let err = tracker
            .track(params(H1, vec![cached("movie.mkv")], false))
            .await
            .unwrap_err();
        assert!(err.is_storage_fault());

        tasks.drain().await;
        assert_eq!(buddy.tracks.load(Ordering::SeqCst), 0);
        assert_eq!(peer.tracks.load(Ordering::SeqCst), 0);
    }
}
