use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{KvStore, StoreError, StoreResult};
use crate::clock::Clock;

/// 两次清扫之间最少的写入次数
const SWEEP_MIN_WRITES: usize = 64;

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Slot {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// 进程内键值存储
///
/// 协调存储不可用时各组件退回到这里，也用作测试替身。
/// 数据只属于当前实例，多实例部署下每个实例各自计数。
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    writes: AtomicUsize,
    /// 写入次数达到该值后清扫一次，随存活键数增长，均摊开销为常数
    sweep_after: AtomicUsize,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            available: AtomicBool::new(true),
            writes: AtomicUsize::new(0),
            sweep_after: AtomicUsize::new(SWEEP_MIN_WRITES),
        }
    }

    /// 关闭后所有操作都返回 [`StoreError::Unavailable`]，用于模拟故障
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 未过期的键数量
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|e| !e.expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store switched off".into()))
        }
    }

    fn deadline(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(ttl)
            .ok()
            .map(|ttl| self.clock.now() + ttl)
    }

    /// 清掉过期的键
    ///
    /// 限流窗口和访客日期键不会被再次读取，只靠读时过期会无限堆积。
    /// 调用时不能持有任何 entry 引用。
    fn after_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes < self.sweep_after.load(Ordering::Relaxed) {
            return;
        }
        self.writes.store(0, Ordering::Relaxed);

        let now = self.clock.now();
        self.entries.retain(|_, slot| !slot.expired(now));
        self.sweep_after
            .store(self.entries.len().max(SWEEP_MIN_WRITES), Ordering::Relaxed);
    }

    /// 在分片锁内对计数做加减，过期的旧值视为 0。
    /// `first_ttl` 只在新值为 1 时生效。
    fn add(&self, key: &str, delta: i64, first_ttl: Option<Duration>) -> StoreResult<i64> {
        let now = self.clock.now();
        let deadline = first_ttl.and_then(|ttl| self.deadline(ttl));

        let result = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                let current = if slot.expired(now) {
                    slot.expires_at = None;
                    Ok(0)
                } else {
                    slot.value.parse::<i64>().map_err(|_| StoreError::NotAnInteger {
                        key: key.to_string(),
                    })
                };
                current.map(|current| {
                    let next = current + delta;
                    slot.value = next.to_string();
                    if next == 1 && deadline.is_some() {
                        slot.expires_at = deadline;
                    }
                    next
                })
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    value: delta.to_string(),
                    expires_at: if delta == 1 { deadline } else { None },
                });
                Ok(delta)
            }
        };

        self.after_write();
        result
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.ensure_available()?;
        let now = self.clock.now();
        let value = match self.entries.get(key) {
            Some(slot) if !slot.expired(now) => Some(slot.value.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if value.is_none() {
            self.entries.remove_if(key, |_, slot| slot.expired(now));
        }
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.ensure_available()?;
        let expires_at = ttl.and_then(|ttl| self.deadline(ttl));
        self.entries.insert(
            key.to_string(),
            Slot {
                value: value.to_string(),
                expires_at,
            },
        );
        self.after_write();
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.ensure_available()?;
        self.entries.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.ensure_available()?;
        self.add(key, 1, None)
    }

    async fn decr(&self, key: &str) -> StoreResult<i64> {
        self.ensure_available()?;
        self.add(key, -1, None)
    }

    async fn incr_expiring(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        self.ensure_available()?;
        self.add(key, 1, Some(ttl))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.ensure_available()?;
        let deadline = self.deadline(ttl);
        if let Some(mut slot) = self.entries.get_mut(key) {
            slot.expires_at = deadline;
        }
        Ok(())
    }

    async fn incr_below(
        &self,
        key: &str,
        limit: i64,
        ttl: Duration,
    ) -> StoreResult<Option<i64>> {
        self.ensure_available()?;
        let now = self.clock.now();
        let deadline = self.deadline(ttl);
        let fresh = Slot {
            value: "1".into(),
            expires_at: deadline,
        };

        let result = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                if slot.expired(now) {
                    *slot = Slot {
                        value: "0".into(),
                        expires_at: deadline,
                    };
                }
                match slot.value.parse::<i64>() {
                    Ok(current) if current >= limit => Ok(None),
                    Ok(current) => {
                        let next = current + 1;
                        slot.value = next.to_string();
                        if next == 1 {
                            slot.expires_at = deadline;
                        }
                        Ok(Some(next))
                    }
                    Err(_) => Err(StoreError::NotAnInteger {
                        key: key.to_string(),
                    }),
                }
            }
            Entry::Vacant(_) if limit < 1 => Ok(None),
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(Some(1))
            }
        };

        self.after_write();
        result
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.ensure_available()?;
        let now = self.clock.now();
        let matches = |key: &str| match pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == pattern,
        };
        Ok(self
            .entries
            .iter()
            .filter(|e| !e.expired(now) && matches(e.key().as_str()))
            .map(|e| e.key().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap());
        (MemoryStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn values_expire_lazily() {
        let (store, clock) = store();
        store
            .set("a", "1", Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));

        clock.advance(chrono::Duration::seconds(10));
        assert_eq!(store.get("a").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn incr_keeps_existing_ttl() {
        let (store, clock) = store();
        assert_eq!(store.incr("c").await.unwrap(), 1);
        store.expire("c", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.incr("c").await.unwrap(), 2);

        clock.advance(chrono::Duration::seconds(6));
        assert_eq!(store.incr("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn incr_below_stops_at_limit() {
        let (store, clock) = store();
        let ttl = Duration::from_secs(60);
        assert_eq!(store.incr_below("q", 2, ttl).await.unwrap(), Some(1));
        assert_eq!(store.incr_below("q", 2, ttl).await.unwrap(), Some(2));
        assert_eq!(store.incr_below("q", 2, ttl).await.unwrap(), None);

        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(store.incr_below("q", 2, ttl).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn switched_off_store_fails_every_call() {
        let (store, _) = store();
        store.set_available(false);
        assert!(matches!(
            store.get("a").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.incr("a").await.is_err());
    }

    #[tokio::test]
    async fn keys_match_prefix_pattern() {
        let (store, _) = store();
        store.set("cache:a:1", "x", None).await.unwrap();
        store.set("cache:b:2", "y", None).await.unwrap();
        store.set("quota:guest:z", "1", None).await.unwrap();

        let mut keys = store.keys("cache:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["cache:a:1", "cache:b:2"]);
    }

    #[tokio::test]
    async fn incr_expiring_sets_ttl_on_first_increment_only() {
        let (store, clock) = store();
        let ttl = Duration::from_secs(10);
        assert_eq!(store.incr_expiring("w", ttl).await.unwrap(), 1);
        clock.advance(chrono::Duration::seconds(6));
        assert_eq!(store.incr_expiring("w", ttl).await.unwrap(), 2);

        // 过期时间从第一次计数算起，不会被后续计数延长
        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(store.get("w").await.unwrap(), None);
        assert_eq!(store.incr_expiring("w", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn expired_keys_are_swept_without_being_read() {
        let (store, clock) = store();
        let ttl = Duration::from_secs(61);

        for i in 0..1000 {
            let key = format!("ratelimit:id{}:{}", i % 10, i);
            store.incr_expiring(&key, ttl).await.unwrap();
            clock.advance(chrono::Duration::seconds(60));
        }

        assert!(store.len() <= 2);
        assert!(store.entries.len() <= SWEEP_MIN_WRITES + 2);
    }

    #[tokio::test]
    async fn sweep_keeps_live_keys() {
        let (store, clock) = store();
        store.set("keep", "1", None).await.unwrap();
        for i in 0..(SWEEP_MIN_WRITES * 3) {
            store
                .set(&format!("tmp:{}", i), "x", Some(Duration::from_secs(1)))
                .await
                .unwrap();
            clock.advance(chrono::Duration::seconds(2));
        }

        assert_eq!(store.get("keep").await.unwrap().as_deref(), Some("1"));
        assert!(store.entries.len() <= SWEEP_MIN_WRITES + 1);
    }
}
