use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::CacheConfig;
use crate::normalize;

/// Response snapshot held by a cache entry.
#[derive(Debug, Clone)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Cache entry with freshness metadata. Stored only when the policy engine
/// decided cacheable with ttl > 0; expiry is purely elapsed time past TTL.
#[derive(Debug, Clone)]
struct CacheEntry {
    response: StoredResponse,
    created_at: SystemTime,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        match self.created_at.elapsed() {
            Ok(elapsed) => elapsed > self.ttl,
            // Clock went backwards; treat as expired.
            Err(_) => true,
        }
    }
}

#[derive(Debug, Default)]
struct CacheStatistics {
    lookups: u64,
    hits: u64,
    misses: u64,
    stale_misses: u64,
    stores: u64,
    banned_entries: u64,
}

/// In-memory store of cached responses keyed by normalized request
/// identity. The policy engine governs what goes in and for how long; the
/// store only enforces freshness and the ban path.
pub struct CacheStore {
    enabled: bool,
    entries: Arc<DashMap<String, CacheEntry>>,
    statistics: Arc<RwLock<CacheStatistics>>,
}

impl CacheStore {
    pub fn new(config: &CacheConfig) -> Self {
        let store = Self {
            enabled: config.enabled,
            entries: Arc::new(DashMap::new()),
            statistics: Arc::new(RwLock::new(CacheStatistics::default())),
        };

        if config.enabled {
            info!("Cache store enabled, default TTL: {:?}", config.default_ttl);
            store.start_cleanup_task();
        }

        store
    }

    fn start_cleanup_task(&self) {
        let entries = self.entries.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;

                let before = entries.len();
                entries.retain(|_key, entry| !entry.is_expired());
                let removed = before - entries.len();
                if removed > 0 {
                    debug!("Cleaned up {} expired cache entries", removed);
                }
            }
        });
    }

    /// Fresh-hit lookup. A present-but-stale entry is a miss: the caller
    /// falls through to the origin rather than serving stale content.
    pub async fn lookup(&self, key: &str) -> Option<StoredResponse> {
        if !self.enabled {
            return None;
        }

        let mut stats = self.statistics.write().await;
        stats.lookups += 1;

        match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => {
                stats.hits += 1;
                debug!("Cache HIT for key: {}", key);
                Some(entry.response.clone())
            }
            Some(entry) => {
                drop(entry);
                self.entries.remove(key);
                stats.misses += 1;
                stats.stale_misses += 1;
                debug!("Cache MISS (stale) for key: {}", key);
                None
            }
            None => {
                stats.misses += 1;
                debug!("Cache MISS for key: {}", key);
                None
            }
        }
    }

    /// Store a response under a key. The ttl has already been decided by
    /// the policy engine; zero-TTL entries are never stored.
    pub async fn store(&self, key: String, response: StoredResponse, ttl: Duration) {
        if !self.enabled || ttl.is_zero() {
            return;
        }

        debug!("Cache SET for key: {}, TTL: {:?}", key, ttl);
        self.entries.insert(
            key,
            CacheEntry {
                response,
                created_at: SystemTime::now(),
                ttl,
            },
        );

        let mut stats = self.statistics.write().await;
        stats.stores += 1;
    }

    /// Ban a URL: drop every normalized key variant it may be cached
    /// under. Returns how many entries were actually removed.
    pub async fn ban(&self, path_and_query: &str) -> usize {
        let mut removed = 0;
        for key in normalize::all_variants(path_and_query) {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }

        if removed > 0 {
            let mut stats = self.statistics.write().await;
            stats.banned_entries += removed as u64;
        }
        debug!("Banned {} ({} entries removed)", path_and_query, removed);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of cache counters for diagnostics.
    pub async fn get_statistics(&self) -> serde_json::Value {
        let stats = self.statistics.read().await;
        serde_json::json!({
            "enabled": self.enabled,
            "entries": self.entries.len(),
            "lookups": stats.lookups,
            "hits": stats.hits,
            "misses": stats.misses,
            "stale_misses": stats.stale_misses,
            "stores": stats.stores,
            "banned_entries": stats.banned_entries,
            "hit_rate": if stats.lookups > 0 {
                stats.hits as f64 / stats.lookups as f64
            } else {
                0.0
            },
        })
    }
}
