use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;

use crate::cache::record::FreshnessPolicy;
use crate::cascade::BreakerConfig;
use crate::torrents::push::{DEFAULT_PUSH_DEBOUNCE, DEFAULT_PUSH_INTERVAL};

/// Staleness windows when a buddy is available to refresh data cheaply.
const BUDDY_CACHED_STALE_SECS: u64 = 10 * 60;
const BUDDY_UNCACHED_STALE_SECS: u64 = 5 * 60;
/// Staleness windows when this instance has to ask a peer or nobody.
const DEFAULT_CACHED_STALE_SECS: u64 = 12 * 60 * 60;
const DEFAULT_UNCACHED_STALE_SECS: u64 = 60 * 60;

const DEFAULT_PEER_SLOW_THRESHOLD_MS: u64 = 10_000;
const DEFAULT_PEER_COOLDOWN_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Tokens peers present to write to this instance
    pub peer_tokens: Vec<String>,
}

impl ServerConfig {
    pub fn accepts_peer_token(&self, token: &str) -> bool {
        !token.is_empty() && self.peer_tokens.iter().any(|t| t == token)
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub buddy_url: Option<String>,
    pub peer_url: Option<String>,
    pub peer_auth_token: Option<String>,
    /// Dedicated peer for torrent metadata pulls; falls back to `peer_url`.
    pub pull_peer_url: Option<String>,
    /// Queue peer availability checks for the background puller instead of
    /// calling the peer on the request path.
    pub lazy_peer: bool,
    pub instance_id: String,
    pub push_debounce_secs: u64,
    pub push_interval_secs: u64,
}

impl UpstreamConfig {
    pub fn has_buddy(&self) -> bool {
        self.buddy_url.is_some()
    }

    pub fn has_peer(&self) -> bool {
        self.peer_url.is_some()
    }

    /// Peer write paths (tracking, pushing) need an auth token.
    pub fn can_report_to_peer(&self) -> bool {
        self.has_peer() && self.peer_auth_token.is_some()
    }

    /// Resolve the pull peer and whether pulling starts out local-only.
    pub fn pull_peer(&self) -> (Option<String>, bool) {
        match (&self.pull_peer_url, &self.peer_url) {
            (Some(url), _) => (Some(url.clone()), true),
            (None, Some(url)) => (Some(url.clone()), false),
            (None, None) => (None, false),
        }
    }

    pub fn push_timing(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.push_debounce_secs),
            Duration::from_secs(self.push_interval_secs.max(1)),
        )
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cached_stale_secs: u64,
    pub uncached_stale_secs: u64,
    /// Disk snapshot of the in-memory availability store
    pub cache_path: PathBuf,
    pub persist_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub slow_threshold_ms: u64,
    pub cooldown_ms: u64,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub mongo_url: Option<String>,
    pub mongo_db: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub cache: CacheConfig,
    pub breaker: BreakerSettings,
    pub storage: StorageConfig,
    /// Enable debug logging for upstream requests (set via CLI)
    pub debug_requests: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let buddy_url = non_empty_env("BUDDY_URL");
        let peer_url = non_empty_env("PEER_URL");
        let peer_auth_token = non_empty_env("PEER_AUTH_TOKEN");
        let pull_peer_url = non_empty_env("PULL_PEER_URL");

        for (name, url) in [
            ("BUDDY_URL", &buddy_url),
            ("PEER_URL", &peer_url),
            ("PULL_PEER_URL", &pull_peer_url),
        ] {
            if let Some(url) = url {
                reqwest::Url::parse(url).with_context(|| format!("{} is not a valid URL", name))?;
            }
        }

        let lazy_peer = env::var("LAZY_PEER")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true"))
            .unwrap_or(false);

        let instance_id = non_empty_env("INSTANCE_ID").unwrap_or_else(generate_instance_id);

        let (default_cached, default_uncached) = if buddy_url.is_some() {
            (BUDDY_CACHED_STALE_SECS, BUDDY_UNCACHED_STALE_SECS)
        } else {
            (DEFAULT_CACHED_STALE_SECS, DEFAULT_UNCACHED_STALE_SECS)
        };

        Ok(Self {
            server: ServerConfig {
                port: env::var("PORT").unwrap_or_else(|_| "8080".to_string()).parse()?,
                peer_tokens: non_empty_env("PEER_TOKENS")
                    .map(|v| {
                        v.split(',')
                            .map(|t| t.trim().to_string())
                            .filter(|t| !t.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
            },
            upstream: UpstreamConfig {
                buddy_url,
                peer_url,
                peer_auth_token,
                pull_peer_url,
                lazy_peer,
                instance_id,
                push_debounce_secs: parse_env("PUSH_DEBOUNCE_SECS", DEFAULT_PUSH_DEBOUNCE.as_secs()),
                push_interval_secs: parse_env("PUSH_INTERVAL_SECS", DEFAULT_PUSH_INTERVAL.as_secs()),
            },
            cache: CacheConfig {
                cached_stale_secs: parse_env("CACHED_STALE_SECS", default_cached),
                uncached_stale_secs: parse_env("UNCACHED_STALE_SECS", default_uncached),
                cache_path: PathBuf::from(
                    env::var("CACHE_PATH").unwrap_or_else(|_| "./heimdall_cache.bin".to_string()),
                ),
                persist_interval_secs: parse_env("CACHE_PERSIST_INTERVAL_SECS", 300),
            },
            breaker: BreakerSettings {
                slow_threshold_ms: parse_env("PEER_SLOW_THRESHOLD_MS", DEFAULT_PEER_SLOW_THRESHOLD_MS),
                cooldown_ms: parse_env("PEER_COOLDOWN_MS", DEFAULT_PEER_COOLDOWN_MS),
            },
            storage: StorageConfig {
                mongo_url: non_empty_env("MONGO_URL"),
                mongo_db: env::var("MONGO_DB").unwrap_or_else(|_| "heimdall".to_string()),
            },
            debug_requests: false, // Set by CLI args in main.rs
        })
    }

    pub fn to_freshness_policy(&self) -> FreshnessPolicy {
        FreshnessPolicy {
            cached: Duration::from_secs(self.cache.cached_stale_secs),
            uncached: Duration::from_secs(self.cache.uncached_stale_secs),
        }
    }

    pub fn to_breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            slow_threshold: Duration::from_millis(self.breaker.slow_threshold_ms),
            cooldown: Duration::from_millis(self.breaker.cooldown_ms),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_env(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn generate_instance_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}
