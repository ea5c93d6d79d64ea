//! Background push of local torrent metadata to the peer.
//!
//! Catalog ids are queued with a debounce; a periodic pass pushes every due
//! id whose last push is stale.

use crate::error::HeimdallError;
use crate::metrics::SharedMetrics;
use crate::torrents::store::TorrentStore;
use crate::torrents::syncinfo::SyncInfo;
use crate::upstream::PeerApi;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub const DEFAULT_PUSH_DEBOUNCE: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_PUSH_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub struct TorrentPusher {
    queue: DashMap<String, Instant>,
    peer: Arc<dyn PeerApi>,
    store: Arc<dyn TorrentStore>,
    sync_info: Arc<SyncInfo>,
    metrics: SharedMetrics,
    debounce: Duration,
    interval: Duration,
}

impl TorrentPusher {
    pub fn new(
        peer: Arc<dyn PeerApi>,
        store: Arc<dyn TorrentStore>,
        sync_info: Arc<SyncInfo>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            queue: DashMap::new(),
            peer,
            store,
            sync_info,
            metrics,
            debounce: DEFAULT_PUSH_DEBOUNCE,
            interval: DEFAULT_PUSH_INTERVAL,
        }
    }

    pub fn with_timing(mut self, debounce: Duration, interval: Duration) -> Self {
        self.debounce = debounce;
        self.interval = interval;
        self
    }

    /// Queue `catalog_id` for a push. Re-queueing restarts the debounce.
    pub fn enqueue(&self, catalog_id: &str) {
        self.queue
            .insert(catalog_id.to_string(), Instant::now() + self.debounce);
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Push every due catalog id. Returns how many pushes succeeded.
    pub async fn process_due(&self) -> usize {
        let now = Instant::now();
        let due: Vec<String> = self
            .queue
            .iter()
            .filter(|entry| *entry.value() <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut pushed = 0;
        for catalog_id in due {
            match self.push_one(&catalog_id).await {
                Ok(true) => pushed += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(catalog_id = %catalog_id, error = %e, "Failed to push torrents");
                    self.metrics.record_torrent_sync("push", "error");
                }
            }
            // dropped whatever the outcome, the next enqueue brings it back
            self.queue.remove_if(&catalog_id, |_, due_at| *due_at <= now);
        }
        pushed
    }

    async fn push_one(&self, catalog_id: &str) -> Result<bool, HeimdallError> {
        if !self.sync_info.should_push(catalog_id).await? {
            debug!(catalog_id = catalog_id, "Push not due yet");
            return Ok(false);
        }

        let data = self.store.list_by_catalog_id(catalog_id).await?;
        if data.items.is_empty() {
            return Ok(false);
        }

        let start = Instant::now();
        self.peer.push_torrents(&data.items).await?;
        info!(
            catalog_id = catalog_id,
            count = data.total_items,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Pushed torrents"
        );
        self.metrics.record_torrent_sync("push", "success");

        if let Err(e) = self.sync_info.mark_pushed(catalog_id).await {
            warn!(catalog_id = catalog_id, error = %e, "Failed to mark torrents pushed");
        }
        Ok(true)
    }

    /// Run until `shutdown_rx` flips to true.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            debounce_secs = self.debounce.as_secs(),
            "Starting torrent pusher"
        );

        loop {
            tokio::select! {
                _ = sleep(self.interval) => {
                    let pushed = self.process_due().await;
                    if pushed > 0 {
                        debug!(pushed = pushed, queued = self.queued(), "Torrent push pass finished");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Torrent pusher shutting down");
                        break;
                    }
                }
            }
        }
    }
}
