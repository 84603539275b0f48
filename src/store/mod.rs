// 协调存储模块
// 多个无状态实例共享的键值存储（Redis），以及进程内的替代实现

pub mod client;
pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;

pub use client::{StoreClient, StoreSettings, StoreStats};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("value at {key} is not an integer")]
    NotAnInteger { key: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// 协调存储需要提供的原语
///
/// 计数类操作（`incr`/`decr`/`incr_below`）必须是原子的，
/// 跨实例的正确性完全依赖于此。
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// 写入值，`ttl` 为空表示不过期
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    async fn del(&self, key: &str) -> StoreResult<()>;

    /// 加一并返回新值，键不存在时从 0 开始，不改变已有的过期时间
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    async fn decr(&self, key: &str) -> StoreResult<i64>;

    /// 加一并返回新值，新值为 1 时同时设置 `ttl`。
    /// 两步在存储侧一次完成，不会留下没有过期时间的计数键。
    async fn incr_expiring(&self, key: &str, ttl: Duration) -> StoreResult<i64>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// 当前值小于 `limit` 时加一并返回新值，否则返回 `None`。
    /// 第一次加一（新值为 1）时设置 `ttl`。
    async fn incr_below(&self, key: &str, limit: i64, ttl: Duration)
    -> StoreResult<Option<i64>>;

    /// 按模式列出键，只需支持末尾 `*` 通配。
    /// 实现不能阻塞整个存储（Redis 上用 SCAN 而不是 KEYS）。
    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>>;
}
