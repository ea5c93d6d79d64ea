//! Torrent metadata federation.
//!
//! Torrent metadata (names, sizes, per-file catalog tags) is pulled from the
//! peer mesh on demand and pushed back to it in the background. A sync-info
//! gate keeps both directions from hammering the peer.

pub mod pull;
pub mod push;
pub mod store;
pub mod syncinfo;

pub use pull::TorrentPullCascade;
pub use push::TorrentPusher;
pub use store::{MemoryTorrentStore, TorrentStore};
pub use syncinfo::{MemorySyncInfoStore, SyncInfo, SyncInfoStore};

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    #[serde(rename = "i")]
    pub index: i32,
    #[serde(rename = "n")]
    pub name: String,
    #[serde(rename = "s")]
    pub size: i64,
    /// Catalog id this file belongs to, empty when unknown.
    #[serde(rename = "sid", default)]
    pub origin_tag: String,
    #[serde(rename = "src", default)]
    pub source: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TorrentItem {
    pub hash: String,
    pub name: String,
    pub size: i64,
    #[serde(rename = "src", default)]
    pub source: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub files: Vec<TorrentFile>,
}

impl TorrentItem {
    /// Only full-length hex info hashes are accepted into local storage.
    pub fn has_valid_hash(&self) -> bool {
        self.hash.len() == 40 && self.hash.bytes().all(|b| b.is_ascii_hexdigit())
    }

    /// Whether any file is tagged with the same catalog root.
    pub fn matches_catalog(&self, catalog_id: &str) -> bool {
        let root = crate::catalog::root_id(catalog_id);
        self.files
            .iter()
            .any(|f| !f.origin_tag.is_empty() && crate::catalog::root_id(&f.origin_tag) == root)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ListTorrentsData {
    pub items: Vec<TorrentItem>,
    #[serde(default)]
    pub total_items: usize,
}

impl ListTorrentsData {
    pub fn new(items: Vec<TorrentItem>) -> Self {
        Self {
            total_items: items.len(),
            items,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn torrent(hash: &str, tags: &[&str]) -> TorrentItem {
        TorrentItem {
            hash: hash.to_string(),
            name: format!("torrent-{}", &hash[..4.min(hash.len())]),
            size: 1_000,
            source: "peer".to_string(),
            category: "series".to_string(),
            files: tags
                .iter()
                .enumerate()
                .map(|(i, tag)| TorrentFile {
                    index: i as i32,
                    name: format!("file-{}.mkv", i),
                    size: 100,
                    origin_tag: tag.to_string(),
                    source: String::new(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_hash_validation() {
        assert!(torrent("c9e15763f722f23e98a29decdfae341b98d53056", &[]).has_valid_hash());
        assert!(!torrent("c9e15763", &[]).has_valid_hash());
        assert!(!torrent("z9e15763f722f23e98a29decdfae341b98d53056", &[]).has_valid_hash());
    }

    #[test]
    fn test_catalog_matching_is_episode_insensitive() {
        let item = torrent("c9e15763f722f23e98a29decdfae341b98d53056", &["tt0944947:1:1", "tt0944947:1:2"]);
        assert!(item.matches_catalog("tt0944947"));
        assert!(item.matches_catalog("tt0944947:2:1"));
        assert!(!item.matches_catalog("tt0111161"));
    }
}
