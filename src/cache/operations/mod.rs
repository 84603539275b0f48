/// 缓存操作
/// 提供缓存层的功能实现

// 通用响应缓存
pub mod cache;

// 用户配额档案缓存
pub mod profile;

pub use cache::{CacheLayer, CacheStats};
pub use profile::ProfileCacheOperations;
