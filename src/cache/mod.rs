// 缓存模块
// 包含缓存键、缓存数据结构和缓存操作

pub mod keys;
pub mod models;
pub mod operations;

// 重新导出常用类型，方便其他模块使用
pub use keys::generate_cache_key;
pub use models::{CacheEntry, CacheOptions};
pub use operations::{CacheLayer, CacheStats};
