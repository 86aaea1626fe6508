//! Content-addressed cache with TTL eviction
//!
//! Shared infrastructure for tile recognition and row validation. Each caller
//! owns a namespaced instance so keys from one subsystem can never collide
//! with the other when snapshots are persisted side by side.
//!
//! Entries are content-addressed (same key means same value), so a plain
//! mutex around the map is the only synchronization needed. Expired entries
//! are dropped lazily on lookup or eagerly by `purge_expired` (run on load);
//! there is no background timer.

use crate::error::PipelineError;
use chrono::{DateTime, Duration, Utc};
use mathpad_common::Clock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// Cache owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheNamespace {
    Recognition,
    Validation,
}

impl CacheNamespace {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheNamespace::Recognition => "recognition",
            CacheNamespace::Validation => "validation",
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

/// On-disk form of one entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedEntry {
    pub namespace: CacheNamespace,
    pub key: String,
    pub value: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

/// Counts from restoring a snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub loaded: usize,
    pub expired: usize,
    pub corrupt: usize,
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Namespaced TTL cache
pub struct Cache<V> {
    namespace: CacheNamespace,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> Cache<V> {
    pub fn new(namespace: CacheNamespace, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            namespace,
            ttl,
            clock,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn namespace(&self) -> CacheNamespace {
        self.namespace
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up a live entry; an expired one is removed and reported as a miss
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut entries = self.lock();
        match entries.get(key).map(|e| e.expires_at > now) {
            Some(true) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                entries.get(key).map(|e| e.value.clone())
            }
            Some(false) => {
                entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(namespace = self.namespace.as_str(), key, "Cache entry expired");
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert with the cache's default TTL
    pub fn put(&self, key: impl Into<String>, value: V) {
        self.put_with_ttl(key, value, self.ttl);
    }

    pub fn put_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let expires_at = self.clock.now() + ttl;
        self.lock().insert(key.into(), CacheEntry { value, expires_at });
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.lock().get(key).is_some_and(|e| e.expires_at > now)
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        let purged = before - entries.len();
        if purged > 0 {
            debug!(namespace = self.namespace.as_str(), purged, "Purged expired cache entries");
        }
        purged
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

impl<V: Clone + Serialize + DeserializeOwned> Cache<V> {
    /// Snapshot live entries for persistence
    pub fn export(&self) -> Vec<PersistedEntry> {
        let now = self.clock.now();
        let entries = self.lock();
        let mut out: Vec<PersistedEntry> = entries
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .filter_map(|(key, e)| match serde_json::to_value(&e.value) {
                Ok(value) => Some(PersistedEntry {
                    namespace: self.namespace,
                    key: key.clone(),
                    value,
                    expires_at: e.expires_at,
                }),
                Err(err) => {
                    warn!(key = %key, error = %err, "Skipping unserializable cache entry");
                    None
                }
            })
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    /// Load entries of this namespace from a snapshot
    ///
    /// Expired entries are skipped; entries whose value no longer decodes are
    /// dropped and treated as misses.
    pub fn restore(&self, snapshot: &[PersistedEntry]) -> RestoreReport {
        let now = self.clock.now();
        let mut report = RestoreReport::default();
        let mut entries = self.lock();

        for persisted in snapshot.iter().filter(|p| p.namespace == self.namespace) {
            if persisted.expires_at <= now {
                report.expired += 1;
                continue;
            }
            match serde_json::from_value::<V>(persisted.value.clone()) {
                Ok(value) => {
                    entries.insert(
                        persisted.key.clone(),
                        CacheEntry {
                            value,
                            expires_at: persisted.expires_at,
                        },
                    );
                    report.loaded += 1;
                }
                Err(e) => {
                    let err = PipelineError::CacheCorrupt(format!("{}: {}", persisted.key, e));
                    warn!(
                        namespace = self.namespace.as_str(),
                        error = %err,
                        "Dropping cache entry"
                    );
                    report.corrupt += 1;
                }
            }
        }

        debug!(
            namespace = self.namespace.as_str(),
            loaded = report.loaded,
            expired = report.expired,
            corrupt = report.corrupt,
            "Restored cache snapshot"
        );
        report
    }
}
