use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database::models::profile::ProfileEntity;

/// 用户配额档案缓存，避免每次请求都查询数据库
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CachedProfile {
    pub id: String,
    pub is_pro: bool,
    pub daily_usage_count: i32,
    pub last_reset_time: DateTime<Utc>,
}

impl From<ProfileEntity> for CachedProfile {
    fn from(entity: ProfileEntity) -> Self {
        Self {
            id: entity.id,
            is_pro: entity.is_pro,
            daily_usage_count: entity.daily_usage_count,
            last_reset_time: entity.last_reset_time,
        }
    }
}
