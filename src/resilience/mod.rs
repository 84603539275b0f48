// 上游调用保护：熔断与并发准入

pub mod admission;
pub mod circuit_breaker;

pub use admission::AdmissionControl;
pub use circuit_breaker::{BreakerConfig, CircuitBreaker, CircuitBreakerState, CircuitPhase};
