//! Availability cascade.
//!
//! A batch of hashes is answered from the local availability cache where
//! possible; the rest goes to exactly one upstream tier (buddy, or else the
//! peer behind its circuit breaker). Whatever the tier answers is written
//! back to the local cache in the background.

pub mod background;
pub mod breaker;
pub mod puller;
pub mod tracker;

pub use background::BackgroundTasks;
pub use breaker::{BreakerConfig, CircuitBreaker};
pub use puller::{MagnetCachePuller, PullerConfig};
pub use tracker::WriteBackTracker;

use crate::cache::record::{dedupe_files, AvailabilityRecord, FileEntry};
use crate::cache::LocalAvailabilityCache;
use crate::catalog::normalize_origin_tag;
use crate::error::HeimdallError;
use crate::magnet::MagnetLink;
use crate::metrics::SharedMetrics;
use crate::upstream::{
    BuddyApi, CheckMagnetData, CheckMagnetItem, CheckMagnetParams, MagnetStatus, PeerApi,
    ResolvedItem,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// The single upstream tier this instance consults for cache misses.
#[derive(Clone)]
pub enum UpstreamTier {
    Buddy(Arc<dyn BuddyApi>),
    Peer {
        client: Arc<dyn PeerApi>,
        breaker: Arc<CircuitBreaker>,
    },
    /// Misses are queued for the background puller instead of asking the
    /// peer on the request path.
    LazyPeer(Arc<MagnetCachePuller>),
    None,
}

impl UpstreamTier {
    /// Pick the one tier that answers misses. A configured buddy always
    /// wins; the peer is only consulted without one.
    pub fn select(
        buddy: Option<Arc<dyn BuddyApi>>,
        peer: Option<(Arc<dyn PeerApi>, Arc<CircuitBreaker>)>,
        lazy_peer: bool,
        local: &LocalAvailabilityCache,
        metrics: &SharedMetrics,
    ) -> Self {
        match (buddy, peer) {
            (Some(buddy), _) => UpstreamTier::Buddy(buddy),
            (None, Some((client, breaker))) if lazy_peer => {
                UpstreamTier::LazyPeer(Arc::new(MagnetCachePuller::new(
                    client,
                    breaker,
                    local.clone(),
                    metrics.clone(),
                    PullerConfig::default(),
                )))
            }
            (None, Some((client, breaker))) => UpstreamTier::Peer { client, breaker },
            (None, None) => UpstreamTier::None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            UpstreamTier::Buddy(_) => "buddy",
            UpstreamTier::Peer { .. } => "peer",
            UpstreamTier::LazyPeer(_) => "lazy_peer",
            UpstreamTier::None => "none",
        }
    }
}

pub struct AvailabilityCascade {
    local: LocalAvailabilityCache,
    tier: UpstreamTier,
    tasks: BackgroundTasks,
    metrics: SharedMetrics,
}

impl AvailabilityCascade {
    pub fn new(
        local: LocalAvailabilityCache,
        tier: UpstreamTier,
        tasks: BackgroundTasks,
        metrics: SharedMetrics,
    ) -> Self {
        info!(tier = tier.name(), "Availability cascade configured");
        Self {
            local,
            tier,
            tasks,
            metrics,
        }
    }

    pub fn tier(&self) -> &UpstreamTier {
        &self.tier
    }

    /// Answer one entry per valid input hash. Only a failing local cache
    /// read is returned as an error; upstream trouble leaves hashes
    /// `unknown`.
    #[instrument(skip(self, query), fields(store = %query.store_code, hash_count = query.hashes.len()))]
    pub async fn check_availability(
        &self,
        query: CheckMagnetParams,
    ) -> Result<CheckMagnetData, HeimdallError> {
        let origin_tag = normalize_origin_tag(&query.origin_tag);
        let store_code = query.store_code.as_str();

        let magnets = parse_magnets(&query.hashes);
        let hashes: Vec<String> = magnets.iter().map(|m| m.hash.clone()).collect();

        let records = self
            .local
            .lookup(store_code, &hashes, &origin_tag)
            .await
            .map_err(into_storage_fault)?;

        let mut data = CheckMagnetData::default();
        let mut pending: Vec<&MagnetLink> = Vec::new();
        let mut stale = 0;

        for magnet in &magnets {
            match records.get(&magnet.hash) {
                Some(record) if !self.local.is_stale(record) => {
                    data.items.push(item_from_record(magnet, record));
                }
                Some(_) => {
                    stale += 1;
                    pending.push(magnet);
                }
                None => pending.push(magnet),
            }
        }

        self.metrics
            .record_local_lookup(data.items.len(), stale, pending.len() - stale);

        if pending.is_empty() {
            return Ok(data);
        }

        let pending_hashes: Vec<String> = pending.iter().map(|m| m.hash.clone()).collect();
        let upstream_query = CheckMagnetParams {
            store_code: query.store_code.clone(),
            hashes: pending_hashes,
            client_ip: query.client_ip.clone(),
            origin_tag: origin_tag.clone(),
            store_token: query.store_token.clone(),
        };

        let resolved = self.resolve_upstream(&upstream_query).await;
        self.merge_resolved(&mut data, &pending, resolved, store_code, &origin_tag);

        Ok(data)
    }

    async fn resolve_upstream(&self, query: &CheckMagnetParams) -> Vec<ResolvedItem> {
        match &self.tier {
            UpstreamTier::Buddy(buddy) => {
                let start = Instant::now();
                let result = buddy.check_magnets(query).await;
                self.absorb("buddy", start, query.hashes.len(), result)
            }
            UpstreamTier::Peer { client, breaker } => {
                if !breaker.allow() {
                    debug!(hash_count = query.hashes.len(), "Peer circuit breaker open, skipping peer");
                    self.metrics.record_upstream_skipped("peer", "check");
                    return Vec::new();
                }

                let start = Instant::now();
                let result = client.check_magnets(query).await;
                if breaker.record(start.elapsed()) {
                    self.metrics.record_breaker_trip();
                }
                self.absorb("peer", start, query.hashes.len(), result)
            }
            UpstreamTier::LazyPeer(puller) => {
                puller.enqueue(query);
                Vec::new()
            }
            UpstreamTier::None => Vec::new(),
        }
    }

    /// Upstream faults are logged and treated as "no opinion".
    fn absorb(
        &self,
        tier: &'static str,
        start: Instant,
        hash_count: usize,
        result: Result<Vec<ResolvedItem>, HeimdallError>,
    ) -> Vec<ResolvedItem> {
        let elapsed = start.elapsed();
        match result {
            Ok(items) => {
                debug!(
                    tier = tier,
                    hash_count = hash_count,
                    resolved = items.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Upstream check succeeded"
                );
                self.metrics
                    .record_upstream_request(tier, "check", "success", elapsed.as_secs_f64());
                items
            }
            Err(e) => {
                warn!(
                    tier = tier,
                    hash_count = hash_count,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "Upstream check failed"
                );
                self.metrics
                    .record_upstream_request(tier, "check", "error", elapsed.as_secs_f64());
                Vec::new()
            }
        }
    }

    fn merge_resolved(
        &self,
        data: &mut CheckMagnetData,
        pending: &[&MagnetLink],
        resolved: Vec<ResolvedItem>,
        store_code: &str,
        origin_tag: &str,
    ) {
        let by_hash: HashMap<&str, &MagnetLink> =
            pending.iter().map(|m| (m.hash.as_str(), *m)).collect();
        let mut done: HashSet<String> = HashSet::with_capacity(pending.len());
        let mut backfill: HashMap<String, Vec<FileEntry>> = HashMap::new();

        for item in resolved {
            let hash = item.hash.to_ascii_lowercase();
            let Some(magnet) = by_hash.get(hash.as_str()) else {
                debug!(hash = %item.hash, "Ignoring unrequested upstream item");
                continue;
            };
            if !done.insert(hash.clone()) {
                continue;
            }

            let files = dedupe_files(&hash, item.backfill_files());
            let cached = item.status == MagnetStatus::Cached;

            data.items.push(CheckMagnetItem {
                hash: hash.clone(),
                magnet: if item.magnet.is_empty() {
                    magnet.link.clone()
                } else {
                    item.magnet
                },
                status: item.status,
                files: if cached {
                    files.iter().map(FileEntry::to_cached_file).collect()
                } else {
                    Vec::new()
                },
            });
            backfill.insert(hash, files);
        }

        for magnet in pending {
            if !done.contains(&magnet.hash) {
                data.items.push(CheckMagnetItem::unknown(&magnet.hash, &magnet.link));
            }
        }

        if backfill.is_empty() {
            return;
        }

        let tier = self.tier.name();
        let count = backfill.len();
        let local = self.local.clone();
        let metrics = self.metrics.clone();
        let store_code = store_code.to_string();
        let origin_tag = origin_tag.to_string();

        self.tasks.spawn("availability_backfill", async move {
            local.bulk_upsert(&store_code, backfill, &origin_tag).await?;
            metrics.record_backfill(tier, count);
            Ok(())
        });
    }
}

/// Parse inputs as magnet references, dropping invalid ones and repeats.
fn parse_magnets(inputs: &[String]) -> Vec<MagnetLink> {
    let mut seen = HashSet::with_capacity(inputs.len());
    let mut magnets = Vec::with_capacity(inputs.len());

    for input in inputs {
        match MagnetLink::parse(input) {
            Ok(magnet) => {
                if seen.insert(magnet.hash.clone()) {
                    magnets.push(magnet);
                }
            }
            Err(e) => debug!(input = %input, error = %e, "Dropping invalid magnet"),
        }
    }

    magnets
}

fn item_from_record(magnet: &MagnetLink, record: &AvailabilityRecord) -> CheckMagnetItem {
    if !record.is_cached {
        return CheckMagnetItem::unknown(&magnet.hash, &magnet.link);
    }
    CheckMagnetItem {
        hash: magnet.hash.clone(),
        magnet: magnet.link.clone(),
        status: MagnetStatus::Cached,
        files: record.files.iter().map(FileEntry::to_cached_file).collect(),
    }
}

fn into_storage_fault(err: HeimdallError) -> HeimdallError {
    if err.is_storage_fault() {
        err
    } else {
        HeimdallError::Storage(err.to_string())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::record::{AvailabilityRecord, CachedFile, FreshnessPolicy};
    use crate::cache::store::{AvailabilityStore, MemoryAvailabilityStore};
    use crate::metrics::create_metrics;
    use crate::torrents::{ListTorrentsData, TorrentItem};
    use crate::upstream::{ListTorrentsParams, TrackMagnetParams};
    use chrono::Utc;
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    pub(crate) const H1: &str = "c9e15763f722f23e98a29decdfae341b98d53056";
    pub(crate) const H2: &str = "08ada5a7a6183aae1e09d831df6748d566095a10";
    pub(crate) const H3: &str = "dd8255ecdc7ca55fb0bbf81323d87062db1f6d1c";

    pub(crate) fn file(index: i32, name: &str) -> FileEntry {
        FileEntry {
            index,
            name: name.to_string(),
            size: 1024,
            origin_tag: String::new(),
        }
    }

    /// Scriptable upstream that counts every call it receives.
    #[derive(Default)]
    pub(crate) struct FakeUpstream {
        pub items: Vec<ResolvedItem>,
        pub fail: bool,
        pub delay: Duration,
        pub checks: AtomicUsize,
        pub tracks: AtomicUsize,
        pub bulk_tracks: AtomicUsize,
        pub pushes: AtomicUsize,
        pub seen_hashes: Mutex<Vec<Vec<String>>>,
        pub tracked: Mutex<Vec<TrackMagnetParams>>,
        pub torrents: Vec<TorrentItem>,
        pub list_calls: Mutex<Vec<ListTorrentsParams>>,
    }

    impl FakeUpstream {
        pub(crate) fn answering(items: Vec<ResolvedItem>) -> Self {
            Self {
                items,
                ..Default::default()
            }
        }

        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        async fn answer(&self, params: &CheckMagnetParams) -> Result<Vec<ResolvedItem>, HeimdallError> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            self.seen_hashes
                .lock()
                .unwrap()
                .push(params.hashes.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(HeimdallError::Upstream("connection refused".into()));
            }
            Ok(self.items.clone())
        }

        fn record_track(&self, params: &TrackMagnetParams) -> Result<(), HeimdallError> {
            self.tracks.fetch_add(1, Ordering::SeqCst);
            self.tracked.lock().unwrap().push(params.clone());
            if self.fail {
                return Err(HeimdallError::Upstream("connection refused".into()));
            }
            Ok(())
        }
    }

    impl BuddyApi for FakeUpstream {
        fn check_magnets<'a>(
            &'a self,
            params: &'a CheckMagnetParams,
        ) -> BoxFuture<'a, Result<Vec<ResolvedItem>, HeimdallError>> {
            self.answer(params).boxed()
        }

        fn track_magnet<'a>(
            &'a self,
            params: &'a TrackMagnetParams,
        ) -> BoxFuture<'a, Result<(), HeimdallError>> {
            futures::future::ready(self.record_track(params)).boxed()
        }

        fn bulk_track_magnets<'a>(
            &'a self,
            _store_code: &'a str,
            _files_by_hash: &'a HashMap<String, Vec<CachedFile>>,
        ) -> BoxFuture<'a, Result<(), HeimdallError>> {
            self.bulk_tracks.fetch_add(1, Ordering::SeqCst);
            let result = if self.fail {
                Err(HeimdallError::Upstream("connection refused".into()))
            } else {
                Ok(())
            };
            futures::future::ready(result).boxed()
        }
    }

    impl PeerApi for FakeUpstream {
        fn check_magnets<'a>(
            &'a self,
            params: &'a CheckMagnetParams,
        ) -> BoxFuture<'a, Result<Vec<ResolvedItem>, HeimdallError>> {
            self.answer(params).boxed()
        }

        fn track_magnet<'a>(
            &'a self,
            params: &'a TrackMagnetParams,
        ) -> BoxFuture<'a, Result<(), HeimdallError>> {
            futures::future::ready(self.record_track(params)).boxed()
        }

        fn list_torrents<'a>(
            &'a self,
            params: &'a ListTorrentsParams,
        ) -> BoxFuture<'a, Result<ListTorrentsData, HeimdallError>> {
            self.list_calls.lock().unwrap().push(params.clone());
            let result = if self.fail {
                Err(HeimdallError::Upstream("connection refused".into()))
            } else {
                Ok(ListTorrentsData::new(self.torrents.clone()))
            };
            futures::future::ready(result).boxed()
        }

        fn push_torrents<'a>(
            &'a self,
            _items: &'a [TorrentItem],
        ) -> BoxFuture<'a, Result<(), HeimdallError>> {
            self.pushes.fetch_add(1, Ordering::SeqCst);
            let result = if self.fail {
                Err(HeimdallError::Upstream("connection refused".into()))
            } else {
                Ok(())
            };
            futures::future::ready(result).boxed()
        }
    }

    /// Availability store whose reads and writes always fail.
    pub(crate) struct BrokenStore;

    impl AvailabilityStore for BrokenStore {
        fn get_many<'a>(
            &'a self,
            _store_code: &'a str,
            _hashes: &'a [String],
        ) -> BoxFuture<'a, Result<Vec<AvailabilityRecord>, HeimdallError>> {
            futures::future::ready(Err(HeimdallError::Storage("connection reset".into()))).boxed()
        }

        fn put_many(&self, _records: Vec<AvailabilityRecord>) -> BoxFuture<'_, Result<(), HeimdallError>> {
            futures::future::ready(Err(HeimdallError::Storage("connection reset".into()))).boxed()
        }
    }

    fn resolved(hash: &str, status: MagnetStatus, files: Vec<FileEntry>) -> ResolvedItem {
        ResolvedItem {
            hash: hash.to_string(),
            magnet: String::new(),
            status,
            files,
        }
    }

    fn local(store: Arc<MemoryAvailabilityStore>) -> LocalAvailabilityCache {
        LocalAvailabilityCache::new(store, FreshnessPolicy::uniform(Duration::from_secs(600)))
    }

    fn query(hashes: &[&str]) -> CheckMagnetParams {
        CheckMagnetParams {
            store_code: "rd".to_string(),
            hashes: hashes.iter().map(|h| h.to_string()).collect(),
            client_ip: "203.0.113.7".to_string(),
            origin_tag: String::new(),
            store_token: "token".to_string(),
        }
    }

    fn peer_tier(peer: Arc<FakeUpstream>, breaker: Arc<CircuitBreaker>) -> UpstreamTier {
        UpstreamTier::Peer {
            client: peer,
            breaker,
        }
    }

    #[tokio::test]
    async fn test_end_to_end_cascade() {
        let store = Arc::new(MemoryAvailabilityStore::new());
        let now = Utc::now();
        store
            .put_many(vec![
                AvailabilityRecord::observed("rd", H1, vec![file(0, "h1.mkv")], "", now),
                AvailabilityRecord::observed(
                    "rd",
                    H2,
                    vec![file(0, "old.mkv")],
                    "",
                    now - chrono::Duration::hours(1),
                ),
            ])
            .await
            .unwrap();

        let buddy = Arc::new(FakeUpstream::answering(vec![
            resolved(H2, MagnetStatus::Cached, vec![file(0, "f1"), file(1, "f1")]),
            resolved(H3, MagnetStatus::Unknown, vec![]),
        ]));
        let tasks = BackgroundTasks::new(8);
        let cascade = AvailabilityCascade::new(
            local(store.clone()),
            UpstreamTier::Buddy(buddy.clone()),
            tasks.clone(),
            create_metrics(),
        );

        let data = cascade.check_availability(query(&[H1, H2, H3])).await.unwrap();

        let hashes: Vec<&str> = data.items.iter().map(|i| i.hash.as_str()).collect();
        assert_eq!(hashes, vec![H1, H2, H3]);
        assert_eq!(data.items[0].status, MagnetStatus::Cached);
        assert_eq!(data.items[1].status, MagnetStatus::Cached);
        assert_eq!(data.items[1].files.len(), 1);
        assert_eq!(data.items[1].files[0].name, "f1");
        assert_eq!(data.items[2].status, MagnetStatus::Unknown);
        assert!(data.items[2].files.is_empty());

        // only the stale and unknown hashes went upstream
        assert_eq!(
            buddy.seen_hashes.lock().unwrap().clone(),
            vec![vec![H2.to_string(), H3.to_string()]]
        );

        tasks.drain().await;
        let cache = local(store);
        let found = cache
            .lookup("rd", &[H2.to_string(), H3.to_string()], "")
            .await
            .unwrap();
        assert!(found[H2].is_cached);
        assert!(!cache.is_stale(&found[H2]));
        assert_eq!(found[H2].files[0].name, "f1");
        assert!(!found[H3].is_cached);
        assert!(!cache.is_stale(&found[H3]));
    }

    #[tokio::test]
    async fn test_at_most_one_upstream_tier() {
        // with buddy configured the peer is never consulted
        let buddy = Arc::new(FakeUpstream::answering(vec![]));
        let cascade = AvailabilityCascade::new(
            local(Arc::new(MemoryAvailabilityStore::new())),
            UpstreamTier::Buddy(buddy.clone()),
            BackgroundTasks::new(8),
            create_metrics(),
        );

        let data = cascade.check_availability(query(&[H1, H2])).await.unwrap();
        assert_eq!(buddy.checks.load(Ordering::SeqCst), 1);
        assert_eq!(data.items.len(), 2);
        assert!(data.items.iter().all(|i| i.status == MagnetStatus::Unknown));
    }

    #[tokio::test]
    async fn test_all_fresh_skips_upstream() {
        let store = Arc::new(MemoryAvailabilityStore::new());
        store
            .put_many(vec![AvailabilityRecord::observed("rd", H1, vec![], "", Utc::now())])
            .await
            .unwrap();
        let buddy = Arc::new(FakeUpstream::answering(vec![]));
        let cascade = AvailabilityCascade::new(
            local(store),
            UpstreamTier::Buddy(buddy.clone()),
            BackgroundTasks::new(8),
            create_metrics(),
        );

        let data = cascade.check_availability(query(&[H1])).await.unwrap();
        assert_eq!(buddy.checks.load(Ordering::SeqCst), 0);
        // a fresh known miss is reported without files
        assert_eq!(data.items[0].status, MagnetStatus::Unknown);
    }

    #[tokio::test]
    async fn test_buddy_failure_degrades_to_unknown() {
        let store = Arc::new(MemoryAvailabilityStore::new());
        store
            .put_many(vec![AvailabilityRecord::observed(
                "rd",
                H1,
                vec![file(0, "a")],
                "",
                Utc::now(),
            )])
            .await
            .unwrap();
        let tasks = BackgroundTasks::new(8);
        let cascade = AvailabilityCascade::new(
            local(store.clone()),
            UpstreamTier::Buddy(Arc::new(FakeUpstream::failing())),
            tasks.clone(),
            create_metrics(),
        );

        let data = cascade.check_availability(query(&[H1, H2])).await.unwrap();
        assert_eq!(data.items.len(), 2);
        assert_eq!(data.items[0].status, MagnetStatus::Cached);
        assert_eq!(data.items[1].status, MagnetStatus::Unknown);

        // nothing is learned from a failed tier
        tasks.drain().await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_and_duplicate_inputs_are_dropped() {
        let cascade = AvailabilityCascade::new(
            local(Arc::new(MemoryAvailabilityStore::new())),
            UpstreamTier::None,
            BackgroundTasks::new(8),
            create_metrics(),
        );

        let magnet = format!("magnet:?xt=urn:btih:{}&dn=Some+Name", H1.to_uppercase());
        let data = cascade
            .check_availability(query(&[H1, "not a hash!", &magnet, ""]))
            .await
            .unwrap();

        assert_eq!(data.items.len(), 1);
        assert_eq!(data.items[0].hash, H1);
        assert_eq!(data.items[0].status, MagnetStatus::Unknown);
    }

    #[tokio::test]
    async fn test_peer_breaker_skips_after_slow_call() {
        let peer = Arc::new(FakeUpstream {
            delay: Duration::from_millis(60),
            ..Default::default()
        });
        let breaker = Arc::new(CircuitBreaker::new(
            "peer",
            BreakerConfig {
                slow_threshold: Duration::from_millis(20),
                cooldown: Duration::from_millis(300),
            },
        ));
        let cascade = AvailabilityCascade::new(
            local(Arc::new(MemoryAvailabilityStore::new())),
            peer_tier(peer.clone(), breaker.clone()),
            BackgroundTasks::new(8),
            create_metrics(),
        );

        // slow but successful call still trips the breaker
        cascade.check_availability(query(&[H1])).await.unwrap();
        assert_eq!(peer.checks.load(Ordering::SeqCst), 1);
        assert!(breaker.is_open());

        let data = cascade.check_availability(query(&[H1])).await.unwrap();
        assert_eq!(peer.checks.load(Ordering::SeqCst), 1);
        assert_eq!(data.items[0].status, MagnetStatus::Unknown);

        tokio::time::sleep(Duration::from_millis(350)).await;
        cascade.check_availability(query(&[H1])).await.unwrap();
        assert_eq!(peer.checks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_peer_answers_are_backfilled_with_caller_tag() {
        let store = Arc::new(MemoryAvailabilityStore::new());
        let peer = Arc::new(FakeUpstream::answering(vec![resolved(
            H1,
            MagnetStatus::Cached,
            vec![file(0, "e1.mkv")],
        )]));
        let tasks = BackgroundTasks::new(8);
        let cascade = AvailabilityCascade::new(
            local(store.clone()),
            peer_tier(peer, Arc::new(CircuitBreaker::new("peer", BreakerConfig::default()))),
            tasks.clone(),
            create_metrics(),
        );

        let mut q = query(&[H1]);
        q.origin_tag = "tt0944947:1:1".to_string();
        let data = cascade.check_availability(q).await.unwrap();
        assert_eq!(data.items[0].status, MagnetStatus::Cached);

        tasks.drain().await;
        let records = store.all_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].origin_tag, "tt0944947:1:1");
        assert_eq!(records[0].files[0].origin_tag, "tt0944947:1:1");
    }

    #[tokio::test]
    async fn test_unrequested_upstream_items_are_ignored() {
        let buddy = Arc::new(FakeUpstream::answering(vec![
            resolved(H3, MagnetStatus::Cached, vec![file(0, "x")]),
            resolved(&H1.to_uppercase(), MagnetStatus::Downloading, vec![file(0, "y")]),
        ]));
        let cascade = AvailabilityCascade::new(
            local(Arc::new(MemoryAvailabilityStore::new())),
            UpstreamTier::Buddy(buddy),
            BackgroundTasks::new(8),
            create_metrics(),
        );

        let data = cascade.check_availability(query(&[H1])).await.unwrap();
        assert_eq!(data.items.len(), 1);
        assert_eq!(data.items[0].hash, H1);
        assert_eq!(data.items[0].status, MagnetStatus::Downloading);
        assert!(data.items[0].files.is_empty());
    }

    #[tokio::test]
    async fn test_storage_fault_propagates() {
        let buddy = Arc::new(FakeUpstream::answering(vec![]));
        let cascade = AvailabilityCascade::new(
            LocalAvailabilityCache::new(Arc::new(BrokenStore), FreshnessPolicy::default()),
            UpstreamTier::Buddy(buddy.clone()),
            BackgroundTasks::new(8),
            create_metrics(),
        );

        let err = cascade.check_availability(query(&[H1])).await.unwrap_err();
        assert!(err.is_storage_fault());
        assert_eq!(buddy.checks.load(Ordering::SeqCst), 0);
    }

    fn default_breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("peer", BreakerConfig::default()))
    }

    #[tokio::test]
    async fn test_select_prefers_buddy_over_peer() {
        let metrics = create_metrics();
        let cache = local(Arc::new(MemoryAvailabilityStore::new()));

        for lazy_peer in [false, true] {
            let buddy = Arc::new(FakeUpstream::answering(vec![]));
            let peer = Arc::new(FakeUpstream::answering(vec![]));
            let tier = UpstreamTier::select(
                Some(buddy.clone() as Arc<dyn BuddyApi>),
                Some((peer.clone() as Arc<dyn PeerApi>, default_breaker())),
                lazy_peer,
                &cache,
                &metrics,
            );
            assert_eq!(tier.name(), "buddy");

            let cascade =
                AvailabilityCascade::new(cache.clone(), tier, BackgroundTasks::new(8), metrics.clone());
            cascade.check_availability(query(&[H1, H2])).await.unwrap();
            assert_eq!(buddy.checks.load(Ordering::SeqCst), 1);
            assert_eq!(peer.checks.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_select_without_buddy() {
        let metrics = create_metrics();
        let cache = local(Arc::new(MemoryAvailabilityStore::new()));
        let peer = || Some((Arc::new(FakeUpstream::default()) as Arc<dyn PeerApi>, default_breaker()));

        let eager = UpstreamTier::select(None, peer(), false, &cache, &metrics);
        assert_eq!(eager.name(), "peer");

        let lazy = UpstreamTier::select(None, peer(), true, &cache, &metrics);
        assert_eq!(lazy.name(), "lazy_peer");

        for lazy_peer in [false, true] {
            let none = UpstreamTier::select(None, None, lazy_peer, &cache, &metrics);
            assert_eq!(none.name(), "none");
        }
    }

    #[tokio::test]
    async fn test_peer_failure_degrades_to_unknown() {
        let store = Arc::new(MemoryAvailabilityStore::new());
        let peer = Arc::new(FakeUpstream::failing());
        let breaker = default_breaker();
        let tasks = BackgroundTasks::new(8);
        let cascade = AvailabilityCascade::new(
            local(store.clone()),
            peer_tier(peer.clone(), breaker.clone()),
            tasks.clone(),
            create_metrics(),
        );

        let data = cascade.check_availability(query(&[H1, H2])).await.unwrap();
        assert_eq!(peer.checks.load(Ordering::SeqCst), 1);
        assert_eq!(data.items.len(), 2);
        assert!(data.items.iter().all(|i| i.status == MagnetStatus::Unknown));
        assert!(data.items.iter().all(|i| i.files.is_empty()));
        // a fast failure does not trip the breaker
        assert!(!breaker.is_open());

        tasks.drain().await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_slow_failing_peer_trips_breaker() {
        let peer = Arc::new(FakeUpstream {
            delay: Duration::from_millis(60),
            fail: true,
            ..Default::default()
        });
        let breaker = Arc::new(CircuitBreaker::new(
            "peer",
            BreakerConfig {
                slow_threshold: Duration::from_millis(20),
                cooldown: Duration::from_secs(60),
            },
        ));
        let cascade = AvailabilityCascade::new(
            local(Arc::new(MemoryAvailabilityStore::new())),
            peer_tier(peer.clone(), breaker.clone()),
            BackgroundTasks::new(8),
            create_metrics(),
        );

        let data = cascade.check_availability(query(&[H1])).await.unwrap();
        assert_eq!(data.items[0].status, MagnetStatus::Unknown);
        assert!(breaker.is_open());

        cascade.check_availability(query(&[H1])).await.unwrap();
        assert_eq!(peer.checks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hit_for_another_tag_goes_upstream() {
        let store = Arc::new(MemoryAvailabilityStore::new());
        let tagged = FileEntry {
            origin_tag: "tt0944947:1:1".to_string(),
            ..file(0, "e1.mkv")
        };
        store
            .put_many(vec![AvailabilityRecord::observed(
                "rd",
                H1,
                vec![tagged],
                "tt0944947:1:1",
                Utc::now(),
            )])
            .await
            .unwrap();
        let buddy = Arc::new(FakeUpstream::answering(vec![]));
        let cascade = AvailabilityCascade::new(
            local(store),
            UpstreamTier::Buddy(buddy.clone()),
            BackgroundTasks::new(8),
            create_metrics(),
        );

        let mut q = query(&[H1]);
        q.origin_tag = "tt0944947:1:2".to_string();
        let data = cascade.check_availability(q).await.unwrap();
        assert_eq!(data.items[0].status, MagnetStatus::Unknown);
        assert_eq!(
            buddy.seen_hashes.lock().unwrap().clone(),
            vec![vec![H1.to_string()]]
        );

        let mut q = query(&[H1]);
        q.origin_tag = "tt0944947:1:1".to_string();
        let data = cascade.check_availability(q).await.unwrap();
        assert_eq!(data.items[0].status, MagnetStatus::Cached);
        assert_eq!(buddy.checks.load(Ordering::SeqCst), 1);
    }
}
