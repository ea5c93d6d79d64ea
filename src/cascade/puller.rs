//! Background peer puller for lazy peer mode.
//!
//! Instead of asking the peer on the request path, cache misses are queued
//! here and checked in batches. Answers land in the local availability
//! cache, so the next request for the same hash is a local hit.

use crate::cache::record::dedupe_files;
use crate::cache::LocalAvailabilityCache;
use crate::cascade::breaker::CircuitBreaker;
use crate::metrics::SharedMetrics;
use crate::upstream::{CheckMagnetParams, PeerApi};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct PullerConfig {
    /// How long a queued hash waits before it is checked
    pub debounce: Duration,
    /// How often the queue is scanned for due hashes
    pub poll_interval: Duration,
    /// Maximum hashes per peer call
    pub chunk_size: usize,
    /// Longest pause before a chunk while the breaker is open
    pub halted_wait: Duration,
}

impl Default for PullerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(30),
            poll_interval: Duration::from_secs(60),
            chunk_size: 500,
            halted_wait: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    store_code: String,
    origin_tag: String,
}

#[derive(Debug, Clone)]
struct QueuedHash {
    client_ip: String,
    store_token: String,
    due_at: Instant,
}

pub struct MagnetCachePuller {
    queue: Mutex<HashMap<GroupKey, HashMap<String, QueuedHash>>>,
    peer: Arc<dyn PeerApi>,
    breaker: Arc<CircuitBreaker>,
    local: LocalAvailabilityCache,
    metrics: SharedMetrics,
    config: PullerConfig,
}

impl MagnetCachePuller {
    pub fn new(
        peer: Arc<dyn PeerApi>,
        breaker: Arc<CircuitBreaker>,
        local: LocalAvailabilityCache,
        metrics: SharedMetrics,
        config: PullerConfig,
    ) -> Self {
        Self {
            queue: Mutex::new(HashMap::new()),
            peer,
            breaker,
            local,
            metrics,
            config,
        }
    }

    /// Queue the hashes of `query` for a later peer check. Hashes already
    /// queued keep their original due time.
    pub fn enqueue(&self, query: &CheckMagnetParams) {
        let key = GroupKey {
            store_code: query.store_code.clone(),
            origin_tag: query.origin_tag.clone(),
        };
        let due_at = Instant::now() + self.config.debounce;

        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let group = queue.entry(key).or_default();
        for hash in &query.hashes {
            group.entry(hash.clone()).or_insert_with(|| QueuedHash {
                client_ip: query.client_ip.clone(),
                store_token: query.store_token.clone(),
                due_at,
            });
        }

        debug!(
            store = %query.store_code,
            hash_count = query.hashes.len(),
            "Queued hashes for peer pull"
        );
    }

    pub fn queued(&self) -> usize {
        let queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.values().map(HashMap::len).sum()
    }

    /// Remove and return every due hash, grouped.
    fn take_due(&self) -> Vec<(GroupKey, Vec<(String, QueuedHash)>)> {
        let now = Instant::now();
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());

        let mut due = Vec::new();
        for (key, group) in queue.iter_mut() {
            let hashes: Vec<String> = group
                .iter()
                .filter(|(_, q)| q.due_at <= now)
                .map(|(h, _)| h.clone())
                .collect();
            if hashes.is_empty() {
                continue;
            }
            let mut items: Vec<(String, QueuedHash)> = hashes
                .into_iter()
                .filter_map(|h| group.remove(&h).map(|q| (h, q)))
                .collect();
            items.sort_by(|a, b| a.0.cmp(&b.0));
            due.push((key.clone(), items));
        }
        queue.retain(|_, group| !group.is_empty());

        due
    }

    /// Check every due hash against the peer. Returns the number of hashes
    /// processed.
    pub async fn process_due(&self) -> usize {
        let due = self.take_due();
        let mut processed = 0;

        for (key, items) in due {
            let client_ips = distinct(items.iter().map(|(_, q)| q.client_ip.as_str()));
            let store_tokens = distinct(items.iter().map(|(_, q)| q.store_token.as_str()));
            let hashes: Vec<String> = items.into_iter().map(|(h, _)| h).collect();

            for (i, chunk) in hashes.chunks(self.config.chunk_size.max(1)).enumerate() {
                if !self.breaker.allow() {
                    let wait = self.breaker.remaining_cooldown().min(self.config.halted_wait);
                    debug!(wait_ms = wait.as_millis() as u64, "Peer halted, waiting before pull");
                    sleep(wait).await;
                }

                let params = CheckMagnetParams {
                    store_code: key.store_code.clone(),
                    hashes: chunk.to_vec(),
                    client_ip: client_ips[i % client_ips.len()].clone(),
                    origin_tag: key.origin_tag.clone(),
                    store_token: store_tokens[i % store_tokens.len()].clone(),
                };
                self.pull_chunk(&params).await;
                processed += chunk.len();
            }
        }

        processed
    }

    async fn pull_chunk(&self, params: &CheckMagnetParams) {
        let start = Instant::now();
        let result = self.peer.check_magnets(params).await;
        let elapsed = start.elapsed();
        if self.breaker.record(elapsed) {
            self.metrics.record_breaker_trip();
        }

        let items = match result {
            Ok(items) => {
                info!(
                    store = %params.store_code,
                    hash_count = params.hashes.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Pulled magnet cache from peer"
                );
                self.metrics
                    .record_upstream_request("peer", "pull", "success", elapsed.as_secs_f64());
                items
            }
            Err(e) => {
                warn!(
                    store = %params.store_code,
                    hash_count = params.hashes.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "Failed to pull magnet cache from peer"
                );
                self.metrics
                    .record_upstream_request("peer", "pull", "error", elapsed.as_secs_f64());
                return;
            }
        };

        let files_by_hash: HashMap<String, _> = items
            .into_iter()
            .filter(|item| params.hashes.contains(&item.hash))
            .map(|item| {
                let files = dedupe_files(&item.hash, item.backfill_files());
                (item.hash, files)
            })
            .collect();
        let count = files_by_hash.len();

        match self
            .local
            .bulk_upsert(&params.store_code, files_by_hash, &params.origin_tag)
            .await
        {
            Ok(()) => self.metrics.record_backfill("peer", count),
            Err(e) => error!(error = %e, "Failed to store pulled magnet cache"),
        }
    }

    /// Run until `shutdown_rx` flips to true.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Starting magnet cache puller"
        );

        loop {
            if *shutdown_rx.borrow() {
                info!("Magnet cache puller received shutdown signal");
                break;
            }

            let processed = self.process_due().await;
            if processed > 0 {
                debug!(processed = processed, remaining = self.queued(), "Puller pass complete");
            }

            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        info!("Magnet cache puller stopped");
    }
}

fn distinct<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        if !out.iter().any(|v| v == value) {
            out.push(value.to_string());
        }
    }
    out
}
