use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 缓存条目
///
/// `tags` 目前只做记录，失效只支持整个命名空间清空。
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CacheEntry<T> {
    pub data: T,
    pub timestamp: i64, // Unix timestamp (ms)
    #[serde(default)]
    pub tags: Vec<String>,
}

/// 写入选项
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// 为空时使用缓存层的默认 TTL
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl CacheOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            tags: Vec::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}
