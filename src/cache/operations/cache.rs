use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};

use crate::cache::keys::{CACHE_NAMESPACE, cache_entry_key};
use crate::cache::models::{CacheEntry, CacheOptions};
use crate::clock::Clock;
use crate::store::StoreClient;

/// 进程内的缓存计数，重启后清零
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub invalidations: u64,
}

/// 响应缓存
///
/// 所有方法都不会因为协调存储故障而失败：读取退化为未命中，写入被忽略。
pub struct CacheLayer {
    store: StoreClient,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheLayer {
    pub fn new(store: StoreClient, clock: Arc<dyn Clock>, default_ttl: Duration) -> Self {
        Self {
            store,
            clock,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    fn miss<T>(&self) -> Option<T> {
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let Some(store) = self.store.get_client() else {
            return self.miss();
        };

        let raw = match store.get(&cache_entry_key(key)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return self.miss(),
            Err(e) => {
                self.store.record_error(&e);
                return self.miss();
            }
        };

        match serde_json::from_str::<CacheEntry<T>>(&raw) {
            Ok(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.data)
            }
            Err(e) => {
                tracing::warn!(key, "Malformed cache entry: {}", e);
                self.miss()
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, options: CacheOptions) {
        let Some(store) = self.store.get_client() else {
            return;
        };

        let entry = CacheEntry {
            data: value,
            timestamp: self.clock.now_millis(),
            tags: options.tags,
        };
        let json = match serde_json::to_string(&entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(key, "Failed to serialize cache entry: {}", e);
                return;
            }
        };

        let ttl = options.ttl.unwrap_or(self.default_ttl);
        match store.set(&cache_entry_key(key), &json, Some(ttl)).await {
            Ok(()) => {
                self.sets.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => self.store.record_error(&e),
        }
    }

    pub async fn delete(&self, key: &str) {
        let Some(store) = self.store.get_client() else {
            return;
        };
        if let Err(e) = store.del(&cache_entry_key(key)).await {
            self.store.record_error(&e);
        }
    }

    /// 命中时直接返回缓存值；未命中时调用 `fetch` 一次并缓存结果。
    /// `fetch` 失败时错误原样返回，不写缓存。
    pub async fn wrap<T, E, F, Fut>(&self, key: &str, options: CacheOptions, fetch: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.wrap_with_hit(key, options, fetch)
            .await
            .map(|(value, _)| value)
    }

    /// 与 [`CacheLayer::wrap`] 相同，额外返回是否命中
    pub async fn wrap_with_hit<T, E, F, Fut>(
        &self,
        key: &str,
        options: CacheOptions,
        fetch: F,
    ) -> Result<(T, bool), E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(cached) = self.get::<T>(key).await {
            return Ok((cached, true));
        }

        let value = fetch().await?;
        self.set(key, &value, options).await;
        Ok((value, false))
    }

    /// 删除命名空间下的全部键，返回删除数量
    pub async fn clear(&self) -> usize {
        let Some(store) = self.store.get_client() else {
            return 0;
        };

        let keys = match store.keys(&format!("{}*", CACHE_NAMESPACE)).await {
            Ok(keys) => keys,
            Err(e) => {
                self.store.record_error(&e);
                return 0;
            }
        };

        let mut removed = 0;
        for key in keys {
            match store.del(&key).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    self.store.record_error(&e);
                    break;
                }
            }
        }

        self.invalidations
            .fetch_add(removed as u64, Ordering::Relaxed);
        tracing::info!(removed, "Cache namespace cleared");
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{KvStore, MemoryStore, StoreSettings};
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        cache: CacheLayer,
        memory: Arc<MemoryStore>,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let memory = Arc::new(MemoryStore::new(clock_arc.clone()));
        let store = StoreClient::new(memory.clone(), StoreSettings::default(), clock_arc.clone());
        Fixture {
            cache: CacheLayer::new(store, clock_arc, Duration::from_secs(3600)),
            memory,
            clock,
        }
    }

    #[tokio::test]
    async fn get_returns_only_data_and_counts_hits() {
        let f = fixture();
        f.cache
            .set("k", &vec![1, 2, 3], CacheOptions::default().with_tags(["a"]))
            .await;

        assert_eq!(f.cache.get::<Vec<i32>>("k").await, Some(vec![1, 2, 3]));
        assert_eq!(f.cache.get::<Vec<i32>>("missing").await, None);

        let stats = f.cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.sets), (1, 1, 1));
    }

    #[tokio::test]
    async fn malformed_entry_is_a_miss() {
        let f = fixture();
        f.memory.set("cache:bad", "not json", None).await.unwrap();
        assert_eq!(f.cache.get::<String>("bad").await, None);
        assert_eq!(f.cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let f = fixture();
        f.cache
            .set("k", &"v", CacheOptions::ttl(Duration::from_secs(5)))
            .await;
        f.clock.advance(chrono::Duration::seconds(6));
        assert_eq!(f.cache.get::<String>("k").await, None);
    }

    #[tokio::test]
    async fn get_never_fails_when_store_is_down() {
        let f = fixture();
        f.cache.set("k", &"v", CacheOptions::default()).await;
        f.memory.set_available(false);

        assert_eq!(f.cache.get::<String>("k").await, None);
        f.cache.set("k2", &"v", CacheOptions::default()).await;
        f.cache.delete("k").await;
        assert_eq!(f.cache.stats().sets, 1);
    }

    #[tokio::test]
    async fn wrap_fetches_once_per_cold_key() {
        let f = fixture();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let fetch = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>("fresh".to_string())
        };

        let first = f.cache.wrap("w", CacheOptions::default(), fetch).await;
        let second = f.cache.wrap("w", CacheOptions::default(), fetch).await;

        assert_eq!(first.unwrap(), "fresh");
        assert_eq!(second.unwrap(), "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wrap_does_not_cache_errors() {
        let f = fixture();
        let failed: Result<String, String> = f
            .cache
            .wrap("w", CacheOptions::default(), || async { Err("nope".to_string()) })
            .await;
        assert_eq!(failed.unwrap_err(), "nope");
        assert_eq!(f.cache.get::<String>("w").await, None);
        assert_eq!(f.cache.stats().sets, 0);
    }

    #[tokio::test]
    async fn clear_removes_namespace_only() {
        let f = fixture();
        f.cache.set("a", &1, CacheOptions::default()).await;
        f.cache.set("b", &2, CacheOptions::default()).await;
        f.memory.set("quota:guest:x", "1", None).await.unwrap();

        assert_eq!(f.cache.clear().await, 2);
        assert_eq!(f.cache.stats().invalidations, 2);
        assert_eq!(f.memory.len(), 1);
    }
}
