//! Two-tier TTL cache shared by every AI and scraping operation (spec §4.C2).

mod memory;
mod persistent;

use futures::future::{FutureExt, Shared};
use memory::{MemoryTier, StoredEntry};
use persistent::PersistentTier;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub memory_bytes: usize,
    pub entry_count: usize,
    pub persistent_io_warnings: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

type InFlight = Shared<Pin<Box<dyn Future<Output = Result<Vec<u8>, String>> + Send>>>;

/// Owns both tiers plus the in-flight compute registry. Constructed once by
/// the `Runtime` and handed out by reference — never a global singleton.
pub struct Cache {
    memory: AsyncMutex<MemoryTier>,
    persistent: AsyncMutex<PersistentTier>,
    in_flight: StdMutex<HashMap<String, InFlight>>,
    enabled: bool,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Cache {
    pub fn new(
        enabled: bool,
        memory_max_entries: usize,
        memory_max_mb: usize,
        persistent_dir: impl Into<std::path::PathBuf>,
        default_ttl: Duration,
    ) -> Self {
        Self {
            memory: AsyncMutex::new(MemoryTier::new(memory_max_entries, memory_max_mb)),
            persistent: AsyncMutex::new(PersistentTier::new(persistent_dir)),
            in_flight: StdMutex::new(HashMap::new()),
            enabled,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.enabled {
            return None;
        }
        let raw = self.get_bytes(key).await?;
        bincode::deserialize(&raw).ok()
    }

    async fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        {
            let mut mem = self.memory.lock().await;
            if let Some(entry) = mem.get(key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value);
            }
        }
        let mut persistent = self.persistent.lock().await;
        let Some((value, remaining_ttl)) = persistent.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        drop(persistent);
        self.hits.fetch_add(1, Ordering::Relaxed);
        // promote into memory, subject to eviction, carrying the disk
        // entry's own remaining TTL rather than this cache's default
        let mut mem = self.memory.lock().await;
        mem.set(
            key.to_string(),
            StoredEntry {
                value: value.clone(),
                created_at: std::time::Instant::now(),
                ttl: remaining_ttl,
                size_bytes: value.len(),
            },
        );
        Some(value)
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        if !self.enabled {
            return;
        }
        let Ok(bytes) = bincode::serialize(value) else {
            return;
        };
        self.set_bytes(key, bytes, ttl).await;
    }

    async fn set_bytes(&self, key: &str, bytes: Vec<u8>, ttl: Duration) {
        if ttl.is_zero() {
            // expired-on-write
            let mut mem = self.memory.lock().await;
            mem.remove(key);
            let mut persistent = self.persistent.lock().await;
            persistent.remove(key);
            return;
        }
        {
            let mut mem = self.memory.lock().await;
            mem.set(
                key.to_string(),
                StoredEntry {
                    value: bytes.clone(),
                    created_at: std::time::Instant::now(),
                    ttl,
                    size_bytes: bytes.len(),
                },
            );
        }
        let mut persistent = self.persistent.lock().await;
        persistent.set(key, bytes, ttl);
    }

    /// Glob-matches both tiers and evicts.
    pub async fn invalidate_pattern(&self, pattern: &str) -> u64 {
        let mem_removed = self.memory.lock().await.invalidate_pattern(pattern);
        let disk_removed = self.persistent.lock().await.invalidate_pattern(pattern);
        mem_removed + disk_removed
    }

    /// Guarantees at-most-one concurrent compute per key: concurrent callers
    /// coalesce onto the first in-flight computation and receive its result;
    /// failure propagates to all waiters and is not cached.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        factory: F,
    ) -> Result<(T, bool), String>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, String>> + Send + 'static,
    {
        if let Some(hit) = self.get::<T>(key).await {
            return Ok((hit, true));
        }

        // Check-and-insert must be one critical section: under the real
        // multi-threaded runtime, two separate lock acquisitions here would
        // let two first-callers both observe an empty slot and both run
        // `factory()`.
        let (shared, owner) = {
            let mut guard = self.in_flight.lock().unwrap();
            if let Some(existing) = guard.get(key) {
                (existing.clone(), false)
            } else {
                let fut: Pin<Box<dyn Future<Output = Result<Vec<u8>, String>> + Send>> =
                    Box::pin(async move {
                        let value = factory().await?;
                        bincode::serialize(&value).map_err(|e| e.to_string())
                    });
                let shared = fut.shared();
                guard.insert(key.to_string(), shared.clone());
                (shared, true)
            }
        };

        let result = shared.await;
        if owner {
            self.in_flight.lock().unwrap().remove(key);
        }

        match result {
            Ok(bytes) => {
                if owner {
                    self.set_bytes(key, bytes.clone(), ttl).await;
                }
                let value: T = bincode::deserialize(&bytes).map_err(|e| e.to_string())?;
                Ok((value, false))
            }
            Err(e) => Err(e),
        }
    }

    /// Kicks off background precomputations in priority order. Warming
    /// never blocks a foreground request: callers get a detached task
    /// handle and move on.
    pub fn warm_cache<I>(self: &Arc<Self>, keyed_factories: I) -> tokio::task::JoinHandle<()>
    where
        I: IntoIterator<Item = (String, Duration, Pin<Box<dyn Future<Output = Result<Vec<u8>, String>> + Send>>)>
            + Send
            + 'static,
    {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            for (key, ttl, fut) in keyed_factories {
                match fut.await {
                    Ok(bytes) => cache.set_bytes(&key, bytes, ttl).await,
                    Err(e) => tracing::warn!(key, error = %e, "cache warm computation failed"),
                }
            }
        })
    }

    pub async fn stats(&self) -> CacheStats {
        let mem = self.memory.lock().await;
        let persistent = self.persistent.lock().await;
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: mem.evictions,
            memory_bytes: mem.byte_count(),
            entry_count: mem.entry_count(),
            persistent_io_warnings: persistent.io_warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_cache() -> Cache {
        let dir = tempfile::tempdir().unwrap();
        Cache::new(true, 100, 10, dir.into_path(), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = test_cache();
        cache.set("k", &"v".to_string(), Duration::from_secs(60)).await;
        let got: Option<String> = cache.get("k").await;
        assert_eq!(got, Some("v".to_string()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn get_or_compute_coalesces_concurrent_callers() {
        let cache = Arc::new(test_cache());
        let call_count = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let call_count = Arc::clone(&call_count);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("shared-key", Duration::from_secs(60), || {
                        let call_count = Arc::clone(&call_count);
                        async move {
                            call_count.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(30)).await;
                            Ok::<_, String>(42i32)
                        }
                    })
                    .await
                    .unwrap()
                    .0
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), 42);
        }
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stats_track_hits_and_misses() {
        let cache = test_cache();
        cache.set("k", &"v".to_string(), Duration::from_secs(60)).await;
        let _: Option<String> = cache.get("k").await;
        let _: Option<String> = cache.get("missing").await;
        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[tokio::test]
    async fn get_or_compute_failure_is_not_cached() {
        let cache = test_cache();
        let result = cache
            .get_or_compute("bad-key", Duration::from_secs(60), || async {
                Err::<i32, _>("boom".to_string())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(cache.get::<i32>("bad-key").await, None);
    }
}
