//! HTTP surface: availability checks and tracking for store adapters and
//! peers, torrent metadata listing and ingestion, health and metrics.

use crate::cache::record::CachedFile;
use crate::cache::MemoryAvailabilityStore;
use crate::cascade::{
    AvailabilityCascade, BackgroundTasks, CircuitBreaker, WriteBackTracker,
};
use crate::catalog::is_catalog_id;
use crate::config::ServerConfig;
use crate::error::HeimdallError;
use crate::metrics::SharedMetrics;
use crate::torrents::{ListTorrentsData, TorrentItem, TorrentPullCascade, TorrentPusher, TorrentStore};
use crate::upstream::{
    ApiEnvelope, CheckMagnetData, CheckMagnetParams, TrackMagnetParams, HEADER_CLIENT_IP,
    HEADER_ORIGIN_INSTANCE_ID, HEADER_PEER_TOKEN, HEADER_STORE_AUTHORIZATION, HEADER_STORE_NAME,
};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub cascade: Arc<AvailabilityCascade>,
    pub tracker: Arc<WriteBackTracker>,
    pub torrents: Arc<TorrentPullCascade>,
    pub torrent_store: Arc<dyn TorrentStore>,
    pub pusher: Option<Arc<TorrentPusher>>,
    pub breaker: Option<Arc<CircuitBreaker>>,
    pub memory: Option<Arc<MemoryAvailabilityStore>>,
    pub tasks: BackgroundTasks,
    pub metrics: SharedMetrics,
    pub server: Arc<ServerConfig>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/v0/store/magnets/check",
            get(check_magnets).post(track_magnet),
        )
        .route("/v0/store/magnets/track", post(bulk_track_magnets))
        .route("/v0/torrents", get(list_torrents).post(record_torrents))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn envelope<T>(data: T) -> Json<ApiEnvelope<T>> {
    Json(ApiEnvelope {
        data: Some(data),
        error: None,
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("")
}

fn store_code(headers: &HeaderMap) -> Result<String, HeimdallError> {
    let store = header_str(headers, HEADER_STORE_NAME);
    if store.is_empty() {
        return Err(HeimdallError::BadRequest("missing store name".to_string()));
    }
    Ok(store.to_lowercase())
}

fn store_token(headers: &HeaderMap) -> String {
    let value = header_str(headers, HEADER_STORE_AUTHORIZATION);
    value.strip_prefix("Bearer ").unwrap_or(value).trim().to_string()
}

fn require_peer(state: &AppState, headers: &HeaderMap) -> Result<(), HeimdallError> {
    if state
        .server
        .accepts_peer_token(header_str(headers, HEADER_PEER_TOKEN))
    {
        Ok(())
    } else {
        Err(HeimdallError::Unauthorized)
    }
}

/// `GET /v0/store/magnets/check?magnet=..&magnet=..&client_ip=..&sid=..`
///
/// `magnet` may repeat and each value may hold a comma-separated list.
async fn check_magnets(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Result<Json<ApiEnvelope<CheckMagnetData>>, HeimdallError> {
    let mut hashes = Vec::new();
    let mut client_ip = String::new();
    let mut origin_tag = String::new();

    for (key, value) in pairs {
        match key.as_str() {
            "magnet" => hashes.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(String::from),
            ),
            "client_ip" => client_ip = value,
            "sid" => origin_tag = value,
            _ => {}
        }
    }

    if hashes.is_empty() {
        return Err(HeimdallError::BadRequest("missing magnet".to_string()));
    }
    if client_ip.is_empty() {
        client_ip = header_str(&headers, HEADER_CLIENT_IP).to_string();
    }

    let query = CheckMagnetParams {
        store_code: store_code(&headers)?,
        hashes,
        client_ip,
        origin_tag,
        store_token: store_token(&headers),
    };

    let data = state.cascade.check_availability(query).await?;
    Ok(envelope(data))
}

#[derive(Deserialize, Debug)]
struct TrackMagnetPayload {
    hash: String,
    #[serde(default)]
    files: Vec<CachedFile>,
    #[serde(default)]
    is_miss: bool,
    #[serde(default)]
    sid: String,
}

#[derive(Serialize, Debug, Default)]
struct Accepted {}

/// `POST /v0/store/magnets/check`: a peer reporting one observation.
async fn track_magnet(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<TrackMagnetPayload>,
) -> Result<impl IntoResponse, HeimdallError> {
    require_peer(&state, &headers)?;

    let params = TrackMagnetParams {
        store_code: store_code(&headers)?,
        hash: payload.hash,
        files: payload.files,
        is_miss: payload.is_miss,
        origin_tag: payload.sid,
        store_token: store_token(&headers),
    };
    state.tracker.track(params).await?;

    Ok((StatusCode::ACCEPTED, envelope(Accepted::default())))
}

#[derive(Deserialize, Debug)]
struct BulkTrackPayload {
    files_by_hash: HashMap<String, Vec<CachedFile>>,
}

/// `POST /v0/store/magnets/track`: store-wide refresh with no catalog
/// context.
async fn bulk_track_magnets(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<BulkTrackPayload>,
) -> Result<impl IntoResponse, HeimdallError> {
    require_peer(&state, &headers)?;

    let store = store_code(&headers)?;
    state
        .tracker
        .bulk_track(&store, payload.files_by_hash, &store_token(&headers))
        .await?;

    Ok((StatusCode::ACCEPTED, envelope(Accepted::default())))
}

#[derive(Deserialize, Debug)]
struct ListTorrentsQuery {
    #[serde(default)]
    sid: String,
    #[serde(default)]
    local_only: String,
}

/// `GET /v0/torrents?sid=..[&local_only=1]`
async fn list_torrents(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListTorrentsQuery>,
) -> Result<impl IntoResponse, HeimdallError> {
    if query.sid.is_empty() {
        return Err(HeimdallError::BadRequest("missing sid".to_string()));
    }
    if !is_catalog_id(&query.sid) {
        return Err(HeimdallError::BadRequest("unsupported sid".to_string()));
    }

    let origin_instance_id = header_str(&headers, HEADER_ORIGIN_INSTANCE_ID);
    let local_only = !query.local_only.is_empty();

    let data: ListTorrentsData = state
        .torrents
        .list_by_catalog_id(&query.sid, local_only, origin_instance_id)
        .await?;

    // only requests from local users queue a push
    if origin_instance_id.is_empty() {
        if let Some(pusher) = &state.pusher {
            pusher.enqueue(&query.sid);
        }
    }

    let mut response_headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(state.torrents.instance_id()) {
        response_headers.insert(HEADER_ORIGIN_INSTANCE_ID, value);
    }

    Ok((response_headers, envelope(data)))
}

#[derive(Deserialize, Debug)]
struct RecordTorrentsPayload {
    #[serde(default)]
    items: Vec<TorrentItem>,
}

#[derive(Serialize, Debug)]
struct RecordTorrentsData {
    received: usize,
}

/// `POST /v0/torrents`: a peer pushing torrent metadata. Stored in the
/// background.
async fn record_torrents(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RecordTorrentsPayload>,
) -> Result<impl IntoResponse, HeimdallError> {
    require_peer(&state, &headers)?;

    let received = payload.items.len();
    debug!(count = received, "Received pushed torrents");

    let store = state.torrent_store.clone();
    state.tasks.spawn("record_torrents", async move {
        store.upsert(payload.items).await.map(|_| ())
    });

    Ok((StatusCode::ACCEPTED, envelope(RecordTorrentsData { received })))
}

/// Refresh gauges that are sampled rather than counted.
fn refresh_gauges(state: &AppState) {
    let metrics = &state.metrics;
    metrics
        .uptime_seconds
        .set(state.started_at.elapsed().as_secs_f64());
    metrics
        .background_tasks_in_flight
        .set(state.tasks.in_flight() as f64);
    metrics
        .pull_local_only
        .set(if state.torrents.is_pull_local_only() { 1.0 } else { 0.0 });
    if let Some(breaker) = &state.breaker {
        metrics
            .breaker_open
            .set(if breaker.is_open() { 1.0 } else { 0.0 });
    }
    if let Some(memory) = &state.memory {
        metrics.local_records_total.set(memory.len() as f64);
    }
}

/// Metrics endpoint handler
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    refresh_gauges(&state);
    let output = state.metrics.render();

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        output,
    )
}

/// Health check endpoint
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let breaker_open = state.breaker.as_ref().map(|b| b.is_open()).unwrap_or(false);
    let pull_local_only = state.torrents.is_pull_local_only();

    let status = if breaker_open { "degraded" } else { "healthy" };

    let body = serde_json::json!({
        "status": status,
        "tier": state.cascade.tier().name(),
        "breaker_open": breaker_open,
        "pull_local_only": pull_local_only,
        "local_records": state.memory.as_ref().map(|m| m.len()),
        "background_tasks": state.tasks.in_flight(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
    });

    (
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}
