use std::sync::Arc;

use cache::CacheLayer;
use clock::Clock;
use config::Config;
use database::ProfileStore;
use monitor::PerformanceMonitor;
use quota::{QuotaAccountant, QuotaLimits};
use resilience::{AdmissionControl, BreakerConfig, CircuitBreaker};
use store::{MemoryStore, StoreClient};
use upstream::Generator;

pub mod cache;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod middleware;
pub mod monitor;
pub mod quota;
pub mod resilience;
pub mod routes;
pub mod store;
pub mod upstream;
pub mod utils;

pub use routes::router;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: StoreClient,
    pub cache: Arc<CacheLayer>,
    pub rate_limiter: Arc<middleware::RateLimiter>,
    pub breaker: Arc<CircuitBreaker>,
    pub quota: Arc<QuotaAccountant>,
    pub admission: Arc<AdmissionControl>,
    pub monitor: Arc<PerformanceMonitor>,
    pub upstream: Arc<dyn Generator>,
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// 组装所有组件，限流和访客配额共用同一个进程内替代存储
    pub fn new(
        config: Config,
        store: StoreClient,
        profiles: Arc<dyn ProfileStore>,
        upstream: Arc<dyn Generator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let fallback = Arc::new(MemoryStore::new(clock.clone()));

        let cache = CacheLayer::new(store.clone(), clock.clone(), config.cache_ttl());
        let rate_limiter =
            middleware::RateLimiter::new(store.clone(), fallback.clone(), clock.clone());
        let breaker = CircuitBreaker::new(
            store.clone(),
            clock.clone(),
            BreakerConfig::from_config(&config),
        );
        let quota = QuotaAccountant::new(
            store.clone(),
            fallback,
            profiles,
            clock.clone(),
            QuotaLimits::from_config(&config),
            config.profile_cache_ttl(),
        );
        let admission = AdmissionControl::new(store.clone(), config.max_in_flight);
        let monitor = PerformanceMonitor::new(
            config.metrics_capacity,
            config.slow_call_threshold(),
            clock.clone(),
        );

        Self {
            config: Arc::new(config),
            store,
            cache: Arc::new(cache),
            rate_limiter: Arc::new(rate_limiter),
            breaker: Arc::new(breaker),
            quota: Arc::new(quota),
            admission: Arc::new(admission),
            monitor: Arc::new(monitor),
            upstream,
            clock,
        }
    }
}
