use serde::Serialize;

use crate::{
    cache::CacheStats, monitor::OperationSummary, resilience::CircuitBreakerState,
    store::StoreStats,
};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// 协调存储已配置但被暂停时为 "degraded"
    pub status: &'static str,
    pub store: StoreStats,
    pub cache: CacheStats,
    pub circuits: Vec<CircuitBreakerState>,
    pub in_flight: i64,
    pub max_in_flight: u32,
    pub metrics: Vec<OperationSummary>,
}
