//! 熔断器
//!
//! 状态按操作名保存在协调存储中，所有实例共享：
//!
//! ```text
//! Closed   --连续可计失败达到阈值-->  Open{since}
//! Open     --超时后的下一次调用-->    HalfOpen{trials_remaining}
//! HalfOpen --试探全部成功-->          Closed
//! HalfOpen --任一可计失败-->          Open{since}
//! ```
//!
//! 状态转换只在调用时惰性计算，没有后台定时器。
//! 协调存储不可用时视为 Closed，熔断器本身不会成为请求失败的原因。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::keys::{circuit_breaker_failures_key, circuit_breaker_key};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::AppError;
use crate::store::{KvStore, StoreClient};

/// 状态键在最后一次写入后保留的时间
const STATE_RETENTION: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub timeout: Duration,
    /// 半开状态下需要连续成功的次数
    pub half_open_trials: u32,
    /// 只有这些状态码的上游错误计入失败
    pub retryable_statuses: Vec<u16>,
}

impl BreakerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            failure_threshold: config.breaker_failure_threshold,
            timeout: config.breaker_timeout(),
            half_open_trials: config.breaker_half_open_trials,
            ..Self::default()
        }
    }

    fn counts(&self, err: &AppError) -> bool {
        err.upstream_status()
            .is_some_and(|status| self.retryable_statuses.contains(&status))
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            half_open_trials: 3,
            retryable_statuses: vec![429, 500, 502, 503, 504],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CircuitPhase {
    Closed,
    Open { since: DateTime<Utc> },
    HalfOpen { trials_remaining: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub operation: String,
    pub phase: CircuitPhase,
    pub is_open: bool,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

impl CircuitBreakerState {
    fn closed(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            phase: CircuitPhase::Closed,
            is_open: false,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
        }
    }

    fn set_phase(&mut self, phase: CircuitPhase) {
        self.phase = phase;
        self.is_open = matches!(phase, CircuitPhase::Open { .. });
    }
}

pub struct CircuitBreaker {
    store: StoreClient,
    clock: Arc<dyn Clock>,
    defaults: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(store: StoreClient, clock: Arc<dyn Clock>, defaults: BreakerConfig) -> Self {
        Self {
            store,
            clock,
            defaults,
        }
    }

    /// 在熔断保护下执行 `work`
    ///
    /// 熔断打开时返回 [`AppError::CircuitOpen`]，`work` 不会被调用。
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        config: Option<&BreakerConfig>,
        work: F,
    ) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let config = config.unwrap_or(&self.defaults);
        let store = self.store.get_client();
        let mut state = match &store {
            Some(store) => self.load(store.as_ref(), operation).await,
            None => None,
        }
        .unwrap_or_else(|| CircuitBreakerState::closed(operation));

        if let CircuitPhase::Open { since } = state.phase {
            let now = self.clock.now();
            let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
            if elapsed < config.timeout {
                let wait = config.timeout - elapsed;
                return Err(AppError::CircuitOpen {
                    operation: operation.to_string(),
                    retry_after_secs: wait.as_secs() + u64::from(wait.subsec_nanos() > 0),
                });
            }

            tracing::info!(operation, "Circuit timeout elapsed, trying half-open");
            state.set_phase(CircuitPhase::HalfOpen {
                trials_remaining: config.half_open_trials.max(1),
            });
            state.failure_count = 0;
            state.success_count = 0;
            if let Some(store) = &store {
                self.clear_failures(store.as_ref(), operation).await;
            }
        }

        let result = work().await;

        match &result {
            Ok(_) => self.on_success(store.as_deref(), &mut state).await,
            Err(e) if config.counts(e) => {
                self.on_failure(store.as_deref(), &mut state, config).await
            }
            Err(_) => {}
        }

        if let Some(store) = &store {
            self.save(store.as_ref(), &state, config).await;
        }
        result
    }

    async fn on_success(&self, store: Option<&dyn KvStore>, state: &mut CircuitBreakerState) {
        state.success_count = state.success_count.saturating_add(1);

        match state.phase {
            CircuitPhase::HalfOpen { trials_remaining } if trials_remaining > 1 => {
                state.set_phase(CircuitPhase::HalfOpen {
                    trials_remaining: trials_remaining - 1,
                });
            }
            CircuitPhase::HalfOpen { .. } => {
                tracing::info!(operation = %state.operation, "Circuit closed after successful trials");
                state.set_phase(CircuitPhase::Closed);
                state.failure_count = 0;
                state.success_count = 0;
                if let Some(store) = store {
                    self.clear_failures(store, &state.operation).await;
                }
            }
            // 连续失败才会熔断，成功即清零
            CircuitPhase::Closed | CircuitPhase::Open { .. } => {
                if state.failure_count > 0 {
                    state.failure_count = 0;
                    if let Some(store) = store {
                        self.clear_failures(store, &state.operation).await;
                    }
                }
            }
        }
    }

    async fn on_failure(
        &self,
        store: Option<&dyn KvStore>,
        state: &mut CircuitBreakerState,
        config: &BreakerConfig,
    ) {
        let now = self.clock.now();
        let key = circuit_breaker_failures_key(&state.operation);

        // 失败次数以存储中的原子计数为准
        let shared = match store {
            Some(store) => match store.incr(&key).await {
                Ok(count) => {
                    if let Err(e) = store.expire(&key, config.timeout + STATE_RETENTION).await {
                        self.store.record_error(&e);
                    }
                    Some(count.max(0) as u32)
                }
                Err(e) => {
                    self.store.record_error(&e);
                    None
                }
            },
            None => None,
        };
        state.failure_count = shared.unwrap_or_else(|| state.failure_count.saturating_add(1));
        state.last_failure_time = Some(now);

        let reopen = matches!(state.phase, CircuitPhase::HalfOpen { .. });
        if reopen || state.failure_count >= config.failure_threshold {
            tracing::warn!(
                operation = %state.operation,
                failure_count = state.failure_count,
                timeout_secs = config.timeout.as_secs(),
                "Circuit opened"
            );
            state.set_phase(CircuitPhase::Open { since: now });
            state.success_count = 0;
        }
    }

    async fn load(&self, store: &dyn KvStore, operation: &str) -> Option<CircuitBreakerState> {
        let raw = match store.get(&circuit_breaker_key(operation)).await {
            Ok(raw) => raw?,
            Err(e) => {
                self.store.record_error(&e);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(operation, "Discarding malformed circuit state: {}", e);
                None
            }
        }
    }

    /// 整体覆盖写入，后写者胜出
    ///
    /// 并发调用之间没有比较并交换：读到 Closed 的成功调用可能覆盖另一个实例刚写入的 Open。
    /// 失败次数另存在 `:failures` 计数键上，由原子 INCR 维护，下一次可计失败仍会按真实次数重新打开。
    async fn save(&self, store: &dyn KvStore, state: &CircuitBreakerState, config: &BreakerConfig) {
        let json = match serde_json::to_string(state) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(operation = %state.operation, "Failed to serialize circuit state: {}", e);
                return;
            }
        };
        let key = circuit_breaker_key(&state.operation);
        if let Err(e) = store
            .set(&key, &json, Some(config.timeout + STATE_RETENTION))
            .await
        {
            self.store.record_error(&e);
        }
    }

    async fn clear_failures(&self, store: &dyn KvStore, operation: &str) {
        if let Err(e) = store.del(&circuit_breaker_failures_key(operation)).await {
            self.store.record_error(&e);
        }
    }

    /// 当前持久化的状态，没有记录或存储不可用时返回 `None`
    pub async fn get_stats(&self, operation: &str) -> Option<CircuitBreakerState> {
        let store = self.store.get_client()?;
        self.load(store.as_ref(), operation).await
    }

    pub async fn reset(&self, operation: &str) {
        let Some(store) = self.store.get_client() else {
            return;
        };
        if let Err(e) = store.del(&circuit_breaker_key(operation)).await {
            self.store.record_error(&e);
            return;
        }
        self.clear_failures(store.as_ref(), operation).await;
        tracing::info!(operation, "Circuit breaker reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{MemoryStore, StoreSettings};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        breaker: CircuitBreaker,
        memory: Arc<MemoryStore>,
        clock: ManualClock,
        calls: AtomicUsize,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let memory = Arc::new(MemoryStore::new(clock_arc.clone()));
        let store = StoreClient::new(memory.clone(), StoreSettings::default(), clock_arc.clone());
        Fixture {
            breaker: CircuitBreaker::new(store, clock_arc, BreakerConfig::default()),
            memory,
            clock,
            calls: AtomicUsize::new(0),
        }
    }

    impl Fixture {
        async fn call(&self, outcome: Result<&'static str, u16>) -> Result<&'static str, AppError> {
            self.breaker
                .run("generate", None, || async {
                    self.calls.fetch_add(1, Ordering::SeqCst);
                    outcome.map_err(|status| AppError::Upstream {
                        status,
                        message: "upstream".into(),
                    })
                })
                .await
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_and_rejects_without_calling() {
        let f = fixture();
        for _ in 0..5 {
            assert!(matches!(
                f.call(Err(503)).await,
                Err(AppError::Upstream { status: 503, .. })
            ));
        }
        assert_eq!(f.calls(), 5);

        let rejected = f.call(Ok("ok")).await;
        assert!(matches!(
            rejected,
            Err(AppError::CircuitOpen {
                retry_after_secs: 60,
                ..
            })
        ));
        assert_eq!(f.calls(), 5);

        let stats = f.breaker.get_stats("generate").await.unwrap();
        assert!(stats.is_open);
        assert_eq!(stats.failure_count, 5);
    }

    #[tokio::test]
    async fn calls_again_after_timeout_and_closes_after_trials() {
        let f = fixture();
        for _ in 0..5 {
            let _ = f.call(Err(500)).await;
        }
        f.clock.advance(chrono::Duration::seconds(61));

        assert_eq!(f.call(Ok("ok")).await.unwrap(), "ok");
        assert_eq!(f.calls(), 6);
        let stats = f.breaker.get_stats("generate").await.unwrap();
        assert_eq!(
            stats.phase,
            CircuitPhase::HalfOpen {
                trials_remaining: 2
            }
        );
        assert!(!stats.is_open);

        f.call(Ok("ok")).await.unwrap();
        f.call(Ok("ok")).await.unwrap();
        let stats = f.breaker.get_stats("generate").await.unwrap();
        assert_eq!(stats.phase, CircuitPhase::Closed);
        assert_eq!(stats.failure_count, 0);
    }

    #[tokio::test]
    async fn failure_during_half_open_reopens() {
        let f = fixture();
        for _ in 0..5 {
            let _ = f.call(Err(502)).await;
        }
        f.clock.advance(chrono::Duration::seconds(61));

        assert!(f.call(Err(502)).await.is_err());
        assert!(matches!(
            f.call(Ok("ok")).await,
            Err(AppError::CircuitOpen { .. })
        ));
        assert_eq!(f.calls(), 6);
    }

    #[tokio::test]
    async fn non_retryable_errors_are_not_counted() {
        let f = fixture();
        for _ in 0..10 {
            assert!(f.call(Err(400)).await.is_err());
        }
        assert_eq!(f.calls(), 10);
        let stats = f.breaker.get_stats("generate").await.unwrap();
        assert_eq!(stats.failure_count, 0);
        assert!(!stats.is_open);
    }

    #[tokio::test]
    async fn success_clears_consecutive_failures() {
        let f = fixture();
        for _ in 0..4 {
            let _ = f.call(Err(503)).await;
        }
        f.call(Ok("ok")).await.unwrap();
        for _ in 0..4 {
            let _ = f.call(Err(503)).await;
        }
        assert_eq!(f.call(Ok("ok")).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn custom_config_overrides_defaults() {
        let f = fixture();
        let strict = BreakerConfig {
            failure_threshold: 1,
            timeout: Duration::from_secs(5),
            half_open_trials: 1,
            retryable_statuses: vec![418],
        };
        let teapot = || async {
            Err::<(), _>(AppError::Upstream {
                status: 418,
                message: "teapot".into(),
            })
        };

        assert!(f.breaker.run("brew", Some(&strict), teapot).await.is_err());
        assert!(matches!(
            f.breaker.run("brew", Some(&strict), teapot).await,
            Err(AppError::CircuitOpen {
                retry_after_secs: 5,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn store_outage_fails_open() {
        let f = fixture();
        f.memory.set_available(false);
        for _ in 0..10 {
            assert!(matches!(
                f.call(Err(503)).await,
                Err(AppError::Upstream { .. })
            ));
        }
        assert_eq!(f.calls(), 10);
        assert!(f.breaker.get_stats("generate").await.is_none());
    }

    #[tokio::test]
    async fn reset_clears_state() {
        let f = fixture();
        for _ in 0..5 {
            let _ = f.call(Err(503)).await;
        }
        f.breaker.reset("generate").await;
        assert!(f.breaker.get_stats("generate").await.is_none());
        assert_eq!(f.call(Ok("ok")).await.unwrap(), "ok");
    }
}
