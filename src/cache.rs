use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::CacheConfig;
use crate::enrichment::EnrichmentResult;

#[derive(Debug, Clone)]
struct CacheEntry {
    result: EnrichmentResult,
    stored_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() < ttl
    }
}

/// Point-in-time counters. Not transactionally consistent with concurrent
/// writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
}

/// TTL-bounded map from lookup key to enrichment result.
pub struct ResultCache {
    config: CacheConfig,
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<EnrichmentResult> {
        if !self.config.enabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let stale = {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.is_fresh(self.config.ttl) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.result.clone());
                }
                Some(_) => true,
                None => false,
            }
        };

        if stale {
            let mut entries = self.entries.write();
            if entries
                .get(key)
                .map(|entry| !entry.is_fresh(self.config.ttl))
                .unwrap_or(false)
            {
                entries.remove(key);
                trace!(key, "evicted stale cache entry on read");
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn set(&self, key: impl Into<String>, result: EnrichmentResult) {
        if !self.config.enabled {
            return;
        }
        self.entries.write().insert(
            key.into(),
            CacheEntry {
                result,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }

    pub fn clear(&self) {
        self.entries.write().clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    /// Drops every entry older than the TTL and returns how many were freed.
    pub fn sweep_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        let ttl = self.config.ttl;
        entries.retain(|_, entry| entry.is_fresh(ttl));
        before - entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.entries.read().len(),
        }
    }

    /// Starts the periodic sweep on the current tokio runtime. The task ends
    /// when the handle is dropped or the cache itself goes away.
    pub fn spawn_sweeper(self: &Arc<Self>) -> Option<SweepHandle> {
        if !self.config.enabled || self.config.cleanup_interval.is_zero() {
            return None;
        }
        let period = self.config.cleanup_interval;
        let cache: Weak<ResultCache> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.sweep_expired();
                if removed > 0 {
                    debug!(removed, "swept expired enrichment cache entries");
                }
            }
        });
        Some(SweepHandle { task })
    }
}

pub struct SweepHandle {
    task: JoinHandle<()>,
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::enrichment::{EnrichmentResult, ResolvedFields};

    fn config(ttl: Duration) -> CacheConfig {
        CacheConfig {
            enabled: true,
            ttl,
            cleanup_interval: Duration::from_secs(60),
        }
    }

    fn sample(source: &str) -> EnrichmentResult {
        EnrichmentResult::success(
            source,
            ResolvedFields {
                inn: Some("7707083893".into()),
                ..ResolvedFields::default()
            },
            0.3,
        )
    }

    #[test]
    fn returns_stored_results() {
        let cache = ResultCache::new(config(Duration::from_secs(300)));
        cache.set("dadata:7707083893", sample("dadata"));

        let hit = cache.get("dadata:7707083893").unwrap();
        assert_eq!(hit.source, "dadata");
        assert!(cache.get("missing").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn expires_entries_after_ttl() {
        let cache = ResultCache::new(config(Duration::from_millis(100)));
        cache.set("key", sample("adata"));
        assert!(cache.get("key").is_some());

        thread::sleep(Duration::from_millis(150));
        assert!(cache.get("key").is_none());
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn disabled_cache_never_stores() {
        let cache = ResultCache::new(CacheConfig {
            enabled: false,
            ..config(Duration::from_secs(300))
        });
        cache.set("key", sample("gisp"));
        assert!(cache.get("key").is_none());

        let stats = cache.stats();
        assert_eq!(stats.size, 0);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn remove_and_clear_invalidate() {
        let cache = ResultCache::new(config(Duration::from_secs(300)));
        for key in ["a", "b", "c"] {
            cache.set(key, sample("dadata"));
        }
        cache.remove("a");
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());

        cache.clear();
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 0,
                misses: 0,
                size: 0
            }
        );
    }

    #[test]
    fn sweep_frees_only_stale_entries() {
        let cache = ResultCache::new(config(Duration::from_millis(80)));
        cache.set("old", sample("dadata"));
        thread::sleep(Duration::from_millis(120));
        cache.set("new", sample("dadata"));

        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.stats().size, 1);
        assert!(cache.get("new").is_some());
    }

    #[test]
    fn concurrent_writers_and_readers_keep_size_consistent() {
        let cache = Arc::new(ResultCache::new(config(Duration::from_secs(300))));
        let writers = 8;
        let keys_per_writer = 200;

        let mut handles = Vec::new();
        for w in 0..writers {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                for k in 0..keys_per_writer {
                    cache.set(format!("{w}:{k}"), sample("dadata"));
                }
            }));
        }
        for r in 0..6 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                for k in 0..keys_per_writer {
                    let _ = cache.get(&format!("{}:{k}", r % writers));
                    let _ = cache.stats();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.stats().size, writers * keys_per_writer);
    }

    #[tokio::test]
    async fn background_sweeper_frees_memory() {
        let cache = Arc::new(ResultCache::new(CacheConfig {
            enabled: true,
            ttl: Duration::from_millis(20),
            cleanup_interval: Duration::from_millis(30),
        }));
        let _sweeper = cache.spawn_sweeper().unwrap();
        cache.set("key", sample("dadata"));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.stats().size, 0);
    }
}
