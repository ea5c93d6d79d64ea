use crate::cache::record::AvailabilityRecord;
use crate::cache::AvailabilityStore;
use crate::catalog::root_id;
use crate::config::StorageConfig;
use crate::error::HeimdallError;
use crate::torrents::store::{merge_files, sanitize_items};
use crate::torrents::syncinfo::{SyncDirection, SyncInfoRecord};
use crate::torrents::{ListTorrentsData, SyncInfoStore, TorrentItem, TorrentStore};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::TryStreamExt;
use futures::FutureExt;
use mongodb::bson::{doc, to_bson, Document};
use mongodb::options::{ClientOptions, IndexOptions, ReplaceOptions, UpdateOptions};
use mongodb::{Client, Collection, IndexModel};
use tracing::{debug, info};

const AVAILABILITY_COLLECTION: &str = "magnet_cache";
const TORRENTS_COLLECTION: &str = "torrent_info";
const SYNC_INFO_COLLECTION: &str = "torrent_syncinfo";

/// Mongo-backed availability, torrent and sync-info storage.
pub struct MongoStorage {
    availability: Collection<AvailabilityRecord>,
    torrents: Collection<TorrentItem>,
    sync_info: Collection<SyncInfoRecord>,
}

impl MongoStorage {
    pub async fn connect(config: &StorageConfig) -> Result<Self, HeimdallError> {
        let mongo_url = config
            .mongo_url
            .as_ref()
            .ok_or_else(|| HeimdallError::Internal("Mongo URL not configured".to_string()))?;

        let mut client_options = ClientOptions::parse(mongo_url).await?;
        client_options.app_name = Some("Heimdall".to_string());

        let client = Client::with_options(client_options)?;
        let db = client.database(&config.mongo_db);

        let storage = Self {
            availability: db.collection(AVAILABILITY_COLLECTION),
            torrents: db.collection(TORRENTS_COLLECTION),
            sync_info: db.collection(SYNC_INFO_COLLECTION),
        };
        storage.ensure_indexes().await?;

        info!(database = %config.mongo_db, "Connected to MongoDB");
        Ok(storage)
    }

    async fn ensure_indexes(&self) -> Result<(), HeimdallError> {
        let unique = || IndexOptions::builder().unique(true).build();

        self.availability
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "store_code": 1, "info_hash": 1 })
                    .options(unique())
                    .build(),
                None,
            )
            .await?;
        self.torrents
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "hash": 1 })
                    .options(unique())
                    .build(),
                None,
            )
            .await?;
        self.torrents
            .create_index(IndexModel::builder().keys(doc! { "files.sid": 1 }).build(), None)
            .await?;
        self.sync_info
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "catalog_id": 1 })
                    .options(unique())
                    .build(),
                None,
            )
            .await?;
        Ok(())
    }

    async fn find_availability(
        &self,
        store_code: &str,
        hashes: &[String],
    ) -> Result<Vec<AvailabilityRecord>, HeimdallError> {
        if hashes.is_empty() {
            return Ok(Vec::new());
        }

        let filter = doc! {
            "store_code": store_code,
            "info_hash": { "$in": hashes },
        };
        let mut cursor = self.availability.find(filter, None).await?;
        let mut results = Vec::new();
        while let Some(record) = cursor.try_next().await? {
            results.push(record);
        }
        Ok(results)
    }

    async fn replace_availability(&self, records: Vec<AvailabilityRecord>) -> Result<(), HeimdallError> {
        let options = ReplaceOptions::builder().upsert(true).build();
        for record in &records {
            let filter = doc! {
                "store_code": &record.store_code,
                "info_hash": &record.info_hash,
            };
            self.availability
                .replace_one(filter, record, options.clone())
                .await?;
        }
        debug!(count = records.len(), "Replaced availability records");
        Ok(())
    }

    async fn upsert_torrents(&self, items: Vec<TorrentItem>) -> Result<usize, HeimdallError> {
        let items = sanitize_items(items);
        let options = ReplaceOptions::builder().upsert(true).build();

        for mut item in items.iter().cloned() {
            let filter = doc! { "hash": &item.hash };
            if let Some(mut existing) = self.torrents.find_one(filter.clone(), None).await? {
                merge_files(&mut existing.files, std::mem::take(&mut item.files));
                item.files = existing.files;
                if item.source.is_empty() {
                    item.source = existing.source;
                }
                if item.category.is_empty() {
                    item.category = existing.category;
                }
            }
            self.torrents.replace_one(filter, &item, options.clone()).await?;
        }
        Ok(items.len())
    }

    async fn find_torrents(&self, catalog_id: &str) -> Result<ListTorrentsData, HeimdallError> {
        let root = root_id(catalog_id);
        let pattern = format!("^{}(:|$)", regex::escape(root));
        let filter = doc! { "files.sid": { "$regex": pattern } };

        let mut cursor = self.torrents.find(filter, None).await?;
        let mut items = Vec::new();
        while let Some(item) = cursor.try_next().await? {
            if item.matches_catalog(catalog_id) {
                items.push(item);
            }
        }
        items.sort_by(|a, b| a.hash.cmp(&b.hash));
        Ok(ListTorrentsData::new(items))
    }

    async fn mark_sync(
        &self,
        catalog_id: &str,
        direction: SyncDirection,
        at: DateTime<Utc>,
    ) -> Result<(), HeimdallError> {
        let field = match direction {
            SyncDirection::Pull => "pulled_at",
            SyncDirection::Push => "pushed_at",
        };
        let at = to_bson(&at).map_err(|e| HeimdallError::Storage(e.to_string()))?;
        let mut set = Document::new();
        set.insert(field, at);

        self.sync_info
            .update_one(
                doc! { "catalog_id": catalog_id },
                doc! { "$set": set },
                UpdateOptions::builder().upsert(true).build(),
            )
            .await?;
        Ok(())
    }
}

impl AvailabilityStore for MongoStorage {
    fn get_many<'a>(
        &'a self,
        store_code: &'a str,
        hashes: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<AvailabilityRecord>, HeimdallError>> {
        self.find_availability(store_code, hashes).boxed()
    }

    fn put_many(&self, records: Vec<AvailabilityRecord>) -> BoxFuture<'_, Result<(), HeimdallError>> {
        self.replace_availability(records).boxed()
    }
}

impl TorrentStore for MongoStorage {
    fn upsert(&self, items: Vec<TorrentItem>) -> BoxFuture<'_, Result<usize, HeimdallError>> {
        self.upsert_torrents(items).boxed()
    }

    fn list_by_catalog_id<'a>(
        &'a self,
        catalog_id: &'a str,
    ) -> BoxFuture<'a, Result<ListTorrentsData, HeimdallError>> {
        self.find_torrents(catalog_id).boxed()
    }
}

impl SyncInfoStore for MongoStorage {
    fn get<'a>(
        &'a self,
        catalog_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<SyncInfoRecord>, HeimdallError>> {
        async move {
            let row = self
                .sync_info
                .find_one(doc! { "catalog_id": catalog_id }, None)
                .await?;
            Ok(row)
        }
        .boxed()
    }

    fn mark<'a>(
        &'a self,
        catalog_id: &'a str,
        direction: SyncDirection,
        at: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<(), HeimdallError>> {
        self.mark_sync(catalog_id, direction, at).boxed()
    }
}
