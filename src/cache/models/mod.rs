/// 缓存数据模型
/// 定义写入协调存储的数据结构

// 通用缓存条目
pub mod entry;

// 用户配额档案缓存
pub mod profile;

pub use entry::{CacheEntry, CacheOptions};
pub use profile::CachedProfile;
