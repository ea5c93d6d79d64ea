use crate::cache::record::{CachedFile, FileEntry};
use crate::error::HeimdallError;
use crate::torrents::{ListTorrentsData, TorrentItem};
use crate::upstream::{
    build_http_client, join_api_path, parse_base_url, read_envelope, CheckMagnetData, CheckMagnetItem, CheckMagnetParams,
    ListTorrentsParams, MagnetStatus, PeerApi, ResolvedItem, TrackMagnetParams,
    HEADER_ORIGIN_INSTANCE_ID, HEADER_PEER_TOKEN, HEADER_STORE_AUTHORIZATION, HEADER_STORE_NAME,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Client, RequestBuilder, Url};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

const PEER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct TrackBody<'a> {
    hash: &'a str,
    files: &'a [CachedFile],
    is_miss: bool,
    sid: &'a str,
}

#[derive(Serialize)]
struct PushBody<'a> {
    items: &'a [TorrentItem],
}

impl From<CheckMagnetItem> for ResolvedItem {
    fn from(item: CheckMagnetItem) -> Self {
        let files = if item.status == MagnetStatus::Cached {
            item.files
                .into_iter()
                .map(|f| FileEntry {
                    index: f.index,
                    name: f.name,
                    size: f.size,
                    origin_tag: String::new(),
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

/// HTTP client for one peer instance.
#[derive(Clone)]
pub struct PeerClient {
    client: Client,
    base_url: Url,
    peer_token: Option<String>,
}

impl PeerClient {
    pub fn new(base_url: &str, peer_token: Option<String>) -> Result<Self, HeimdallError> {
        Ok(Self {
            client: build_http_client(Some(PEER_TIMEOUT)),
            base_url: parse_base_url(base_url, "peer")?,
            peer_token,
        })
    }

    fn url(&self, path: &str) -> Result<Url, HeimdallError> {
        join_api_path(&self.base_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<RequestBuilder, HeimdallError> {
        let mut req = self.client.request(method, self.url(path)?);
        if let Some(token) = &self.peer_token {
            req = req.header(HEADER_PEER_TOKEN, token);
        }
        Ok(req)
    }

    fn with_store(req: RequestBuilder, store_code: &str, store_token: &str) -> RequestBuilder {
        req.header(HEADER_STORE_NAME, store_code)
            .header(HEADER_STORE_AUTHORIZATION, format!("Bearer {}", store_token))
    }

    #[instrument(skip(self, params), fields(store = %params.store_code, hash_count = params.hashes.len()))]
    async fn check(&self, params: &CheckMagnetParams) -> Result<Vec<ResolvedItem>, HeimdallError> {
        let mut query: Vec<(&str, &str)> = params.hashes.iter().map(|h| ("magnet", h.as_str())).collect();
        query.push(("client_ip", params.client_ip.as_str()));
        if !params.origin_tag.is_empty() {
            query.push(("sid", params.origin_tag.as_str()));
        }

        let start = Instant::now();
        let req = self.request(reqwest::Method::GET, "/v0/store/magnets/check")?;
        let resp = Self::with_store(req, &params.store_code, &params.store_token)
            .query(&query)
            .send()
            .await?;

        debug!(
            status = %resp.status(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Peer check response"
        );

        let data: CheckMagnetData = read_envelope(resp).await?.into_result()?;
        Ok(data.items.into_iter().map(ResolvedItem::from).collect())
    }

    async fn track(&self, params: &TrackMagnetParams) -> Result<(), HeimdallError> {
        let files: &[CachedFile] = if params.is_miss { &[] } else { &params.files };
        let body = TrackBody {
            hash: &params.hash,
            files,
            is_miss: params.is_miss,
            sid: &params.origin_tag,
        };

        let start = Instant::now();
        let req = self.request(reqwest::Method::POST, "/v0/store/magnets/check")?;
        let resp = Self::with_store(req, &params.store_code, &params.store_token)
            .json(&body)
            .send()
            .await?;

        debug!(
            store = %params.store_code,
            status = %resp.status(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Peer track response"
        );

        read_envelope::<serde_json::Value>(resp).await?.into_unit()
    }

    #[instrument(skip(self, params), fields(catalog_id = %params.catalog_id, local_only = params.local_only))]
    async fn list(&self, params: &ListTorrentsParams) -> Result<ListTorrentsData, HeimdallError> {
        let mut query = vec![("sid", params.catalog_id.as_str())];
        if params.local_only {
            query.push(("local_only", "1"));
        }

        let mut req = self
            .request(reqwest::Method::GET, "/v0/torrents")?
            .query(&query);
        if !params.origin_instance_id.is_empty() {
            req = req.header(HEADER_ORIGIN_INSTANCE_ID, &params.origin_instance_id);
        }

        let resp = req.send().await?;
        read_envelope(resp).await?.into_result()
    }

    async fn push(&self, items: &[TorrentItem]) -> Result<(), HeimdallError> {
        let resp = self
            .request(reqwest::Method::POST, "/v0/torrents")?
            .json(&PushBody { items })
            .send()
            .await?;
        read_envelope::<serde_json::Value>(resp).await?.into_unit()
    }
}

impl PeerApi for PeerClient {
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
        self.track(params).boxed()
    }

    fn list_torrents<'a>(
        &'a self,
        params: &'a ListTorrentsParams,
    ) -> BoxFuture<'a, Result<ListTorrentsData, HeimdallError>> {
        self.list(params).boxed()
    }

    fn push_torrents<'a>(
        &'a self,
        items: &'a [TorrentItem],
    ) -> BoxFuture<'a, Result<(), HeimdallError>> {
        self.push(items).boxed()
    }
}
