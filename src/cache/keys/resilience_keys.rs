/// 限流计数键前缀
const RATE_LIMIT_PREFIX: &str = "ratelimit:";

/// 熔断状态键前缀
const CIRCUIT_BREAKER_PREFIX: &str = "circuit-breaker:";

/// 上游并发调用计数键，所有实例共享
pub const IN_FLIGHT_KEY: &str = "upstream:in-flight";

/// 生成限流窗口键
pub fn rate_limit_key(identifier: &str, window: i64) -> String {
    format!("{}{}:{}", RATE_LIMIT_PREFIX, identifier, window)
}

/// 生成熔断状态键
pub fn circuit_breaker_key(operation: &str) -> String {
    format!("{}{}", CIRCUIT_BREAKER_PREFIX, operation)
}

/// 生成熔断失败计数键
pub fn circuit_breaker_failures_key(operation: &str) -> String {
    format!("{}{}:failures", CIRCUIT_BREAKER_PREFIX, operation)
}
