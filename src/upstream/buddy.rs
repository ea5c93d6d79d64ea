use crate::cache::record::{CachedFile, FileEntry};
use crate::error::HeimdallError;
use crate::upstream::{
    build_http_client, join_api_path, parse_base_url, read_envelope, BuddyApi, CheckMagnetParams, MagnetStatus, ResolvedItem,
    TrackMagnetParams, HEADER_CLIENT_IP, HEADER_STORE_NAME,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, instrument};

/// Buddy files use compact keys on the wire.
#[derive(Deserialize, Serialize, Debug, Clone)]
struct BuddyFile {
    #[serde(rename = "i")]
    index: i32,
    #[serde(rename = "n")]
    name: String,
    #[serde(rename = "s")]
    size: i64,
    #[serde(rename = "sid", default)]
    origin_tag: String,
}

#[derive(Deserialize, Debug)]
struct BuddyCheckItem {
    hash: String,
    #[serde(default)]
    magnet: String,
    status: MagnetStatus,
    #[serde(default)]
    files: Vec<BuddyFile>,
}

#[derive(Deserialize, Debug)]
struct BuddyCheckData {
    #[serde(default)]
    items: Vec<BuddyCheckItem>,
}

#[derive(Serialize)]
struct TrackBody<'a> {
    hash: &'a str,
    files: &'a [CachedFile],
    cache_miss: bool,
    sid: &'a str,
}

#[derive(Serialize)]
struct BulkTrackBody<'a> {
    files_by_hash: &'a HashMap<String, Vec<CachedFile>>,
}

impl From<BuddyCheckItem> for ResolvedItem {
    fn from(item: BuddyCheckItem) -> Self {
        let files = if item.status == MagnetStatus::Cached {
            item.files
                .into_iter()
                .map(|f| FileEntry {
                    index: f.index,
                    name: f.name,
                    size: f.size,
                    origin_tag: f.origin_tag,
                })
                .collect()
        } else {
            Vec::new()
        };
        ResolvedItem {
            hash: item.hash,
            magnet: item.magnet,
            status: item.status,
            files,
        }
    }
}

/// HTTP client for the buddy aggregator. No retries: a failed buddy call is
/// a tier with no opinion.
#[derive(Clone)]
pub struct BuddyClient {
    client: Client,
    base_url: Url,
}

impl BuddyClient {
    pub fn new(base_url: &str) -> Result<Self, HeimdallError> {
        Ok(Self {
            client: build_http_client(None),
            base_url: parse_base_url(base_url, "buddy")?,
        })
    }

    fn url(&self, path: &str) -> Result<Url, HeimdallError> {
        join_api_path(&self.base_url, path)
    }

    #[instrument(skip(self, params), fields(store = %params.store_code, hash_count = params.hashes.len()))]
    async fn check(&self, params: &CheckMagnetParams) -> Result<Vec<ResolvedItem>, HeimdallError> {
        let mut query: Vec<(&str, &str)> = params.hashes.iter().map(|h| ("hash", h.as_str())).collect();
        if !params.origin_tag.is_empty() {
            query.push(("sid", params.origin_tag.as_str()));
        }

        let start = Instant::now();
        let resp = self
            .client
            .get(self.url("/v0/store/magnet-cache/check")?)
            .query(&query)
            .header(HEADER_STORE_NAME, &params.store_code)
            .header(HEADER_CLIENT_IP, &params.client_ip)
            .send()
            .await?;

        debug!(
            status = %resp.status(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Buddy check response"
        );

        let data: BuddyCheckData = read_envelope(resp).await?.into_result()?;
        Ok(data.items.into_iter().map(ResolvedItem::from).collect())
    }

    async fn post_track<B: Serialize + ?Sized>(&self, store_code: &str, body: &B) -> Result<(), HeimdallError> {
        let start = Instant::now();
        let resp = self
            .client
            .post(self.url("/v0/store/magnet-cache/track")?)
            .header(HEADER_STORE_NAME, store_code)
            .json(body)
            .send()
            .await?;

        debug!(
            store = store_code,
            status = %resp.status(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Buddy track response"
        );

        read_envelope::<serde_json::Value>(resp).await?.into_unit()
    }
}

impl BuddyApi for BuddyClient {
    fn check_magnets<'a>(
        &'a self,
        params: &'a CheckMagnetParams,
    ) -> BoxFuture<'a, Result<Vec<ResolvedItem>, HeimdallError>> {
        self.check(params).boxed()
    }

    fn track_magnet<'a>(
        &'a self,
        params: &'a TrackMagnetParams,
    ) -> BoxFuture<'a, Result<(), HeimdallError>> {
        async move {
            let files: &[CachedFile] = if params.is_miss { &[] } else { &params.files };
            let body = TrackBody {
                hash: &params.hash,
                files,
                cache_miss: params.is_miss,
                sid: &params.origin_tag,
            };
            self.post_track(&params.store_code, &body).await
        }
        .boxed()
    }

    fn bulk_track_magnets<'a>(
        &'a self,
        store_code: &'a str,
        files_by_hash: &'a HashMap<String, Vec<CachedFile>>,
    ) -> BoxFuture<'a, Result<(), HeimdallError>> {
        async move {
            self.post_track(store_code, &BulkTrackBody { files_by_hash })
                .await
        }
        .boxed()
    }
}
