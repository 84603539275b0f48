use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::{KvStore, RedisStore, StoreError};
use crate::clock::Clock;
use crate::config::Config;

#[derive(Debug, Clone, Copy)]
pub struct StoreSettings {
    /// 冷却窗口内累计错误达到该值后停用
    pub error_threshold: u32,
    pub cooldown: Duration,
}

impl StoreSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            error_threshold: config.store_error_threshold,
            cooldown: config.store_cooldown(),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            error_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub enabled: bool,
    pub error_count: u32,
    pub last_error_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct ErrorWindow {
    count: u32,
    last_error: Option<DateTime<Utc>>,
}

struct Inner {
    store: Option<Arc<dyn KvStore>>,
    settings: StoreSettings,
    errors: Mutex<ErrorWindow>,
    clock: Arc<dyn Clock>,
}

/// 协调存储客户端
///
/// 唯一决定“当前是否降级”的地方：未配置或近期错误过多时
/// [`StoreClient::get_client`] 返回 `None`，所有调用方据此退回进程内实现。
#[derive(Clone)]
pub struct StoreClient {
    inner: Arc<Inner>,
}

impl StoreClient {
    pub fn new(store: Arc<dyn KvStore>, settings: StoreSettings, clock: Arc<dyn Clock>) -> Self {
        Self::build(Some(store), settings, clock)
    }

    /// 没有配置协调存储
    pub fn disabled(clock: Arc<dyn Clock>) -> Self {
        Self::build(None, StoreSettings::default(), clock)
    }

    /// 根据 `REDIS_URL` 创建，URL 缺失或无效时静默停用
    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> Self {
        let settings = StoreSettings::from_config(config);
        match config.redis_url.as_deref() {
            Some(url) => match RedisStore::open(url) {
                Ok(store) => Self::build(Some(Arc::new(store)), settings, clock),
                Err(e) => {
                    tracing::warn!("Invalid REDIS_URL, coordination store disabled: {}", e);
                    Self::build(None, settings, clock)
                }
            },
            None => {
                tracing::info!("REDIS_URL not set, using in-process fallbacks");
                Self::build(None, settings, clock)
            }
        }
    }

    fn build(
        store: Option<Arc<dyn KvStore>>,
        settings: StoreSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                settings,
                errors: Mutex::new(ErrorWindow::default()),
                clock,
            }),
        }
    }

    fn cooldown_elapsed(&self, last_error: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let cooldown = chrono::Duration::from_std(self.inner.settings.cooldown)
            .unwrap_or(chrono::Duration::MAX);
        last_error.is_none_or(|at| now - at >= cooldown)
    }

    /// 返回可用的存储句柄，从不报错
    pub fn get_client(&self) -> Option<Arc<dyn KvStore>> {
        let store = self.inner.store.as_ref()?;

        let mut errors = self.inner.errors.lock();
        if errors.count >= self.inner.settings.error_threshold {
            let now = self.inner.clock.now();
            if !self.cooldown_elapsed(errors.last_error, now) {
                return None;
            }
            tracing::info!("Coordination store cooldown elapsed, re-enabling");
            errors.count = 0;
        }
        Some(store.clone())
    }

    /// 记录一次存储错误
    pub fn record_error(&self, err: &StoreError) {
        let now = self.inner.clock.now();
        let mut errors = self.inner.errors.lock();

        // 只统计冷却窗口内的错误
        if self.cooldown_elapsed(errors.last_error, now) {
            errors.count = 0;
        }
        errors.count += 1;
        errors.last_error = Some(now);

        if errors.count == self.inner.settings.error_threshold {
            tracing::error!(
                error_count = errors.count,
                cooldown_secs = self.inner.settings.cooldown.as_secs(),
                "Coordination store disabled after repeated errors: {}",
                err
            );
        } else {
            tracing::warn!(error_count = errors.count, "Coordination store error: {}", err);
        }
    }

    pub fn is_configured(&self) -> bool {
        self.inner.store.is_some()
    }

    pub fn stats(&self) -> StoreStats {
        let enabled = self.get_client().is_some();
        let errors = self.inner.errors.lock();
        StoreStats {
            enabled,
            error_count: errors.count,
            last_error_time: errors.last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn client(threshold: u32) -> (StoreClient, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(MemoryStore::new(clock_arc.clone()));
        let settings = StoreSettings {
            error_threshold: threshold,
            cooldown: Duration::from_secs(30),
        };
        (StoreClient::new(store, settings, clock_arc), clock)
    }

    fn boom() -> StoreError {
        StoreError::Unavailable("boom".into())
    }

    #[test]
    fn disabled_client_has_no_handle() {
        let client = StoreClient::disabled(Arc::new(crate::clock::SystemClock));
        assert!(client.get_client().is_none());
        assert!(!client.stats().enabled);
    }

    #[test]
    fn disables_after_threshold_and_recovers_after_cooldown() {
        let (client, clock) = client(3);
        client.record_error(&boom());
        client.record_error(&boom());
        assert!(client.get_client().is_some());

        client.record_error(&boom());
        assert!(client.get_client().is_none());
        let stats = client.stats();
        assert!(!stats.enabled);
        assert_eq!(stats.error_count, 3);
        assert!(stats.last_error_time.is_some());

        clock.advance(chrono::Duration::seconds(31));
        assert!(client.get_client().is_some());
        assert_eq!(client.stats().error_count, 0);
    }

    #[test]
    fn stale_errors_do_not_accumulate() {
        let (client, clock) = client(2);
        client.record_error(&boom());
        clock.advance(chrono::Duration::seconds(45));
        client.record_error(&boom());
        assert!(client.get_client().is_some());
        assert_eq!(client.stats().error_count, 1);
    }
}
