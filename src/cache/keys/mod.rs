/// 缓存键模块
/// 协调存储中的全部键空间都在这里生成

// 响应缓存键
pub mod cache_keys;

// 配额相关键
pub mod quota_keys;

// 限流、熔断与准入控制键
pub mod resilience_keys;

pub use cache_keys::{CACHE_NAMESPACE, cache_entry_key, generate_cache_key};
pub use quota_keys::{guest_quota_key, profile_cache_key};
pub use resilience_keys::{
    IN_FLIGHT_KEY, circuit_breaker_failures_key, circuit_breaker_key, rate_limit_key,
};
