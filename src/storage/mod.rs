//! Storage backends.
//!
//! Without a Mongo URL everything lives in memory and the availability
//! records are snapshotted to disk. With one, availability records, torrent
//! metadata and sync info are all kept in Mongo.

pub mod mongo;

pub use mongo::MongoStorage;

use crate::cache::{AvailabilityStore, MemoryAvailabilityStore};
use crate::torrents::{MemorySyncInfoStore, MemoryTorrentStore, SyncInfoStore, TorrentStore};
use std::sync::Arc;

/// The storage handles the rest of the service is built on.
#[derive(Clone)]
pub struct Stores {
    pub availability: Arc<dyn AvailabilityStore>,
    pub torrents: Arc<dyn TorrentStore>,
    pub sync_info: Arc<dyn SyncInfoStore>,
    /// Set when availability records live in memory and need snapshotting.
    pub memory: Option<Arc<MemoryAvailabilityStore>>,
}

impl Stores {
    pub fn in_memory(availability: Arc<MemoryAvailabilityStore>) -> Self {
        Self {
            availability: availability.clone(),
            torrents: Arc::new(MemoryTorrentStore::new()),
            sync_info: Arc::new(MemorySyncInfoStore::new()),
            memory: Some(availability),
        }
    }

    pub fn mongo(storage: MongoStorage) -> Self {
        let storage = Arc::new(storage);
        Self {
            availability: storage.clone(),
            torrents: storage.clone(),
            sync_info: storage,
            memory: None,
        }
    }

    pub fn backend(&self) -> &'static str {
        if self.memory.is_some() {
            "memory"
        } else {
            "mongo"
        }
    }
}
