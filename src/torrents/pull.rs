//! On-demand pull of torrent metadata from the peer mesh.

use crate::cascade::background::BackgroundTasks;
use crate::catalog::root_id;
use crate::error::HeimdallError;
use crate::metrics::SharedMetrics;
use crate::torrents::store::TorrentStore;
use crate::torrents::syncinfo::SyncInfo;
use crate::torrents::ListTorrentsData;
use crate::upstream::{ListTorrentsParams, PeerApi};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

pub struct TorrentPullCascade {
    peer: Option<Arc<dyn PeerApi>>,
    store: Arc<dyn TorrentStore>,
    sync_info: Arc<SyncInfo>,
    instance_id: String,
    /// Forwarded to the pull peer. Once set by a detected loop it stays set
    /// until [`reset_loop_guard`](Self::reset_loop_guard).
    pull_local_only: AtomicBool,
    initial_local_only: bool,
    tasks: BackgroundTasks,
    metrics: SharedMetrics,
}

impl TorrentPullCascade {
    pub fn new(
        peer: Option<Arc<dyn PeerApi>>,
        pull_local_only: bool,
        store: Arc<dyn TorrentStore>,
        sync_info: Arc<SyncInfo>,
        instance_id: String,
        tasks: BackgroundTasks,
        metrics: SharedMetrics,
    ) -> Self {
        metrics
            .pull_local_only
            .set(if pull_local_only { 1.0 } else { 0.0 });
        Self {
            peer,
            store,
            sync_info,
            instance_id,
            pull_local_only: AtomicBool::new(pull_local_only),
            initial_local_only: pull_local_only,
            tasks,
            metrics,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn is_pull_local_only(&self) -> bool {
        self.pull_local_only.load(Ordering::SeqCst)
    }

    /// Undo a loop downgrade, returning to the configured pull mode.
    pub fn reset_loop_guard(&self) {
        self.pull_local_only
            .store(self.initial_local_only, Ordering::SeqCst);
        self.metrics
            .pull_local_only
            .set(if self.initial_local_only { 1.0 } else { 0.0 });
        info!(local_only = self.initial_local_only, "Torrent pull loop guard reset");
    }

    /// List torrents tagged with `catalog_id`, refreshing from the peer
    /// first unless `local_only`. The answer always comes from local
    /// storage.
    #[instrument(skip(self), fields(catalog_id = %catalog_id))]
    pub async fn list_by_catalog_id(
        &self,
        catalog_id: &str,
        local_only: bool,
        origin_instance_id: &str,
    ) -> Result<ListTorrentsData, HeimdallError> {
        if origin_instance_id == self.instance_id
            && self
                .pull_local_only
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            info!(
                origin_instance_id = origin_instance_id,
                "Loop detected for torrent listing, switching to local-only pulls"
            );
            self.metrics.record_loop_detection();
        }

        if !local_only {
            self.pull(catalog_id, origin_instance_id).await?;
        }

        self.store.list_by_catalog_id(catalog_id).await
    }

    /// Only a failing sync-info read is returned; peer trouble is logged.
    async fn pull(&self, catalog_id: &str, origin_instance_id: &str) -> Result<(), HeimdallError> {
        let Some(peer) = &self.peer else {
            return Ok(());
        };
        if !self.sync_info.should_pull(catalog_id).await? {
            return Ok(());
        }

        let params = ListTorrentsParams {
            catalog_id: catalog_id.to_string(),
            local_only: self.is_pull_local_only(),
            origin_instance_id: if origin_instance_id.is_empty() {
                self.instance_id.clone()
            } else {
                origin_instance_id.to_string()
            },
        };

        let start = Instant::now();
        let data = match peer.list_torrents(&params).await {
            Ok(data) => data,
            Err(e) => {
                error!(
                    error = %e,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Failed to pull torrents"
                );
                self.metrics.record_torrent_sync("pull", "error");
                return Ok(());
            }
        };

        let count = data.items.len();
        info!(
            count = count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            local_only = params.local_only,
            "Pulled torrents"
        );

        if let Err(e) = self.store.upsert(data.items).await {
            warn!(error = %e, count = count, "Failed to store pulled torrents");
            self.metrics.record_torrent_sync("pull", "error");
            return Ok(());
        }
        self.metrics.record_torrent_sync("pull", "success");

        let sync_info = self.sync_info.clone();
        let root = root_id(catalog_id).to_string();
        self.tasks.spawn("mark_pulled", async move {
            sync_info.mark_pulled(&root).await
        });

        Ok(())
    }
}
