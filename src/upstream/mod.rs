//! Upstream tiers: the buddy aggregator and the peer mesh.
//!
//! Both speak JSON over HTTP and wrap payloads in the same `{data, error}`
//! envelope. The cascade talks to them through the [`BuddyApi`] and
//! [`PeerApi`] traits so clients are injected at composition time.

pub mod buddy;
pub mod peer;

pub use buddy::BuddyClient;
pub use peer::PeerClient;

use crate::cache::record::{CachedFile, FileEntry};
use crate::error::HeimdallError;
use crate::torrents::{ListTorrentsData, TorrentItem};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::trace;

// lowercase so they can be used as static header names
pub const HEADER_STORE_NAME: &str = "x-heimdall-store-name";
pub const HEADER_STORE_AUTHORIZATION: &str = "x-heimdall-store-authorization";
pub const HEADER_CLIENT_IP: &str = "x-heimdall-client-ip";
pub const HEADER_PEER_TOKEN: &str = "x-heimdall-peer-token";
pub const HEADER_ORIGIN_INSTANCE_ID: &str = "x-heimdall-origin-instance-id";

const USER_AGENT: &str = concat!("heimdall/", env!("CARGO_PKG_VERSION"));

/// Canonical magnet status shared by every store adapter.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MagnetStatus {
    Cached,
    Queued,
    Downloading,
    Processing,
    Downloaded,
    Uploading,
    Failed,
    Invalid,
    #[default]
    #[serde(other)]
    Unknown,
}

/// One entry of an availability answer, as returned to callers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CheckMagnetItem {
    pub hash: String,
    #[serde(default)]
    pub magnet: String,
    pub status: MagnetStatus,
    #[serde(default)]
    pub files: Vec<CachedFile>,
}

impl CheckMagnetItem {
    pub fn unknown(hash: &str, magnet: &str) -> Self {
        Self {
            hash: hash.to_string(),
            magnet: magnet.to_string(),
            status: MagnetStatus::Unknown,
            files: Vec::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckMagnetData {
    pub items: Vec<CheckMagnetItem>,
}

/// An item resolved by an upstream tier. Files keep the origin tag the
/// upstream observed them under, for backfill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedItem {
    pub hash: String,
    pub magnet: String,
    pub status: MagnetStatus,
    pub files: Vec<FileEntry>,
}

impl ResolvedItem {
    pub fn is_cached(&self) -> bool {
        self.status == MagnetStatus::Cached
    }

    /// Files to remember locally: only cached items carry files.
    pub fn backfill_files(&self) -> Vec<FileEntry> {
        if self.is_cached() {
            self.files.clone()
        } else {
            Vec::new()
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub status_code: u16,
}

/// `{data, error}` response envelope.
#[derive(Deserialize, Serialize, Debug)]
pub struct ApiEnvelope<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<ApiErrorBody>,
}

impl<T> ApiEnvelope<T> {
    pub fn into_result(self) -> Result<T, HeimdallError> {
        if let Some(err) = self.error {
            return Err(HeimdallError::Upstream(format!(
                "{} ({}): {}",
                err.code, err.status_code, err.message
            )));
        }
        self.data
            .ok_or_else(|| HeimdallError::Upstream("response without data".to_string()))
    }

    /// For write endpoints whose payload carries nothing of interest.
    pub fn into_unit(self) -> Result<(), HeimdallError> {
        match self.error {
            Some(err) => Err(HeimdallError::Upstream(format!(
                "{} ({}): {}",
                err.code, err.status_code, err.message
            ))),
            None => Ok(()),
        }
    }
}

/// Decode a `{data, error}` envelope. Error bodies on non-2xx responses are
/// surfaced when present, otherwise the bare status.
pub(crate) async fn read_envelope<T: DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<ApiEnvelope<T>, HeimdallError> {
    let status = resp.status();
    let body = resp.bytes().await?;
    trace!(status = %status, response_bytes = body.len(), "Upstream response body received");

    match serde_json::from_slice::<ApiEnvelope<T>>(&body) {
        Ok(envelope) if status.is_success() || envelope.error.is_some() => Ok(envelope),
        Ok(_) => Err(HeimdallError::Upstream(format!("HTTP {}", status))),
        Err(_) if !status.is_success() => Err(HeimdallError::Upstream(format!("HTTP {}", status))),
        Err(e) => Err(HeimdallError::from(e)),
    }
}

pub(crate) fn build_http_client(timeout: Option<std::time::Duration>) -> reqwest::Client {
    let mut builder = reqwest::Client::builder().user_agent(USER_AGENT).no_proxy();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().unwrap_or_else(|_| reqwest::Client::new())
}

/// Parse an upstream base URL so that relative paths extend it. Any path
/// prefix (`http://host/heimdall`) is kept.
pub(crate) fn parse_base_url(raw: &str, what: &str) -> Result<reqwest::Url, HeimdallError> {
    let mut url = reqwest::Url::parse(raw)
        .map_err(|e| HeimdallError::Internal(format!("invalid {} url: {}", what, e)))?;
    if url.cannot_be_a_base() {
        return Err(HeimdallError::Internal(format!("invalid {} url: {}", what, raw)));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// Resolve an API path like `/v0/torrents` below `base`.
pub(crate) fn join_api_path(base: &reqwest::Url, path: &str) -> Result<reqwest::Url, HeimdallError> {
    base.join(path.trim_start_matches('/'))
        .map_err(|e| HeimdallError::Internal(format!("invalid path {}: {}", path, e)))
}

/// A batched availability question forwarded to one upstream tier.
#[derive(Debug, Clone, Default)]
pub struct CheckMagnetParams {
    pub store_code: String,
    pub hashes: Vec<String>,
    pub client_ip: String,
    pub origin_tag: String,
    pub store_token: String,
}

/// A single observation reported upstream.
#[derive(Debug, Clone, Default)]
pub struct TrackMagnetParams {
    pub store_code: String,
    pub hash: String,
    pub files: Vec<CachedFile>,
    pub is_miss: bool,
    pub origin_tag: String,
    pub store_token: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListTorrentsParams {
    pub catalog_id: String,
    pub local_only: bool,
    pub origin_instance_id: String,
}

/// Centralized aggregator.
pub trait BuddyApi: Send + Sync {
    fn check_magnets<'a>(
        &'a self,
        params: &'a CheckMagnetParams,
    ) -> BoxFuture<'a, Result<Vec<ResolvedItem>, HeimdallError>>;

    fn track_magnet<'a>(
        &'a self,
        params: &'a TrackMagnetParams,
    ) -> BoxFuture<'a, Result<(), HeimdallError>>;

    fn bulk_track_magnets<'a>(
        &'a self,
        store_code: &'a str,
        files_by_hash: &'a HashMap<String, Vec<CachedFile>>,
    ) -> BoxFuture<'a, Result<(), HeimdallError>>;
}

/// Another independently operated instance.
pub trait PeerApi: Send + Sync {
    fn check_magnets<'a>(
        &'a self,
        params: &'a CheckMagnetParams,
    ) -> BoxFuture<'a, Result<Vec<ResolvedItem>, HeimdallError>>;

    fn track_magnet<'a>(
        &'a self,
        params: &'a TrackMagnetParams,
    ) -> BoxFuture<'a, Result<(), HeimdallError>>;

    fn list_torrents<'a>(
        &'a self,
        params: &'a ListTorrentsParams,
    ) -> BoxFuture<'a, Result<ListTorrentsData, HeimdallError>>;

    fn push_torrents<'a>(
        &'a self,
        items: &'a [TorrentItem],
    ) -> BoxFuture<'a, Result<(), HeimdallError>>;
}
