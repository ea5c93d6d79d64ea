//! Cache module for heimdall.
//!
//! This module provides the local caching infrastructure:
//! - Availability records with staleness and de-duplication rules
//! - The local availability cache consulted before any upstream tier
//! - Pluggable record persistence with an in-memory store and disk snapshot
//! - A small bounded TTL cache for hot-path memoization

pub mod local;
pub mod persistence;
pub mod record;
pub mod store;

pub use local::LocalAvailabilityCache;
pub use persistence::{load_from_disk, persist_to_disk};
pub use store::{AvailabilityStore, MemoryAvailabilityStore};

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Clone)]
struct CacheEntry<V> {
    data: V,
    inserted_at: Instant,
    expires_at: Instant,
}

/// Bounded in-process key/value cache with per-entry lifetimes.
pub struct TtlCache<K, V> {
    name: &'static str,
    store: Mutex<HashMap<K, CacheEntry<V>>>,
    lifetime: Duration,
    capacity: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    pub fn new(name: &'static str, lifetime: Duration, capacity: usize) -> Self {
        Self {
            name,
            store: Mutex::new(HashMap::new()),
            lifetime,
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut guard = self.store.lock().unwrap_or_else(|e| e.into_inner());
        match guard.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.data.clone()),
            Some(_) => {
                guard.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn add(&self, key: K, value: V) {
        self.add_with_lifetime(key, value, self.lifetime);
    }

    pub fn add_with_lifetime(&self, key: K, value: V, lifetime: Duration) {
        let now = Instant::now();
        let mut guard = self.store.lock().unwrap_or_else(|e| e.into_inner());

        if guard.len() >= self.capacity && !guard.contains_key(&key) {
            guard.retain(|_, entry| entry.expires_at > now);
            if guard.len() >= self.capacity {
                let oldest = guard
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    debug!(cache = self.name, key = ?oldest, "Evicting oldest entry");
                    guard.remove(&oldest);
                }
            }
        }

        guard.insert(
            key,
            CacheEntry {
                data: value,
                inserted_at: now,
                expires_at: now + lifetime,
            },
        );
    }

    pub fn remove(&self, key: &K) {
        let mut guard = self.store.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(key);
    }
}
