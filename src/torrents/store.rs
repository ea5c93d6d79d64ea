use crate::error::HeimdallError;
use crate::torrents::{ListTorrentsData, TorrentFile, TorrentItem};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

/// Torrent metadata persistence keyed by info hash.
pub trait TorrentStore: Send + Sync {
    /// Insert or refresh torrents, returning how many were accepted.
    fn upsert(&self, items: Vec<TorrentItem>) -> BoxFuture<'_, Result<usize, HeimdallError>>;

    fn list_by_catalog_id<'a>(
        &'a self,
        catalog_id: &'a str,
    ) -> BoxFuture<'a, Result<ListTorrentsData, HeimdallError>>;
}

/// Drop items without a full-length hash and normalize the rest.
pub fn sanitize_items(items: Vec<TorrentItem>) -> Vec<TorrentItem> {
    let total = items.len();
    let accepted: Vec<TorrentItem> = items
        .into_iter()
        .filter(TorrentItem::has_valid_hash)
        .map(|mut item| {
            item.hash.make_ascii_lowercase();
            item
        })
        .collect();

    if accepted.len() != total {
        debug!(dropped = total - accepted.len(), "Skipped torrents with invalid hash");
    }
    accepted
}

/// Merge files by name; incoming entries win.
pub fn merge_files(existing: &mut Vec<TorrentFile>, incoming: Vec<TorrentFile>) {
    for file in incoming {
        match existing.iter_mut().find(|f| f.name == file.name) {
            Some(slot) => {
                // keep a known tag when the incoming copy has none
                let origin_tag = if file.origin_tag.is_empty() {
                    std::mem::take(&mut slot.origin_tag)
                } else {
                    file.origin_tag.clone()
                };
                *slot = TorrentFile { origin_tag, ..file };
            }
            None => existing.push(file),
        }
    }
}

#[derive(Default)]
pub struct MemoryTorrentStore {
    items: DashMap<String, TorrentItem>,
}

impl MemoryTorrentStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items.len()
    }
}

impl TorrentStore for MemoryTorrentStore {
    fn upsert(&self, items: Vec<TorrentItem>) -> BoxFuture<'_, Result<usize, HeimdallError>> {
        let items = sanitize_items(items);
        let count = items.len();
        for item in items {
            match self.items.get_mut(&item.hash) {
                Some(mut existing) => {
                    let TorrentItem {
                        name,
                        size,
                        source,
                        category,
                        files,
                        ..
                    } = item;
                    existing.name = name;
                    existing.size = size;
                    if !source.is_empty() {
                        existing.source = source;
                    }
                    if !category.is_empty() {
                        existing.category = category;
                    }
                    merge_files(&mut existing.files, files);
                }
                None => {
                    self.items.insert(item.hash.clone(), item);
                }
            }
        }
        futures::future::ready(Ok(count)).boxed()
    }

    fn list_by_catalog_id<'a>(
        &'a self,
        catalog_id: &'a str,
    ) -> BoxFuture<'a, Result<ListTorrentsData, HeimdallError>> {
        let mut items: Vec<TorrentItem> = self
            .items
            .iter()
            .filter(|entry| entry.value().matches_catalog(catalog_id))
            .map(|entry| entry.value().clone())
            .collect();
        items.sort_by(|a, b| a.hash.cmp(&b.hash));
        futures::future::ready(Ok(ListTorrentsData::new(items))).boxed()
    }
}
