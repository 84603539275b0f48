use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// 配额档案数据库实体（profiles 表）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ProfileEntity {
    pub id: String,
    pub is_pro: bool,
    pub daily_usage_count: i32,
    pub last_reset_time: DateTime<Utc>,
}

impl ProfileEntity {
    /// 首次出现的用户档案
    pub fn new(id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            is_pro: false,
            daily_usage_count: 0,
            last_reset_time: now,
        }
    }
}
