use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::PgPool;

use crate::database::models::profile::ProfileEntity;

/// 配额档案存储
///
/// `try_consume` 必须把“检查额度”和“加一”合成一次原子操作。
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn find(&self, id: &str) -> Result<Option<ProfileEntity>, sqlx::Error>;

    /// 不存在时插入默认档案，已存在则原样返回
    async fn create_default(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<ProfileEntity, sqlx::Error>;

    /// 把 `day_start` 之前重置过的档案清零
    async fn reset_usage(
        &self,
        id: &str,
        now: DateTime<Utc>,
        day_start: DateTime<Utc>,
    ) -> Result<ProfileEntity, sqlx::Error>;

    /// 用量小于 `limit` 时加一并返回更新后的档案，否则返回 `None`
    async fn try_consume(
        &self,
        id: &str,
        limit: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<ProfileEntity>, sqlx::Error>;
}

/// PostgreSQL 存储库实现
pub struct PgProfileRepository {
    pool: PgPool,
}

impl PgProfileRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileStore for PgProfileRepository {
    async fn find(&self, id: &str) -> Result<Option<ProfileEntity>, sqlx::Error> {
        let profile = sqlx::query_as::<_, ProfileEntity>(
            r#"
            SELECT id, is_pro, daily_usage_count, last_reset_time
            FROM profiles
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(profile)
    }

    async fn create_default(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<ProfileEntity, sqlx::Error> {
        tracing::debug!("Creating quota profile: {}", id);

        // DO UPDATE 保证冲突时也能 RETURNING 已有行
        let profile = sqlx::query_as::<_, ProfileEntity>(
            r#"
            INSERT INTO profiles (id, is_pro, daily_usage_count, last_reset_time)
            VALUES ($1, false, 0, $2)
            ON CONFLICT (id) DO UPDATE SET id = EXCLUDED.id
            RETURNING id, is_pro, daily_usage_count, last_reset_time
            "#,
        )
        .bind(id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(profile)
    }

    async fn reset_usage(
        &self,
        id: &str,
        now: DateTime<Utc>,
        day_start: DateTime<Utc>,
    ) -> Result<ProfileEntity, sqlx::Error> {
        let reset = sqlx::query_as::<_, ProfileEntity>(
            r#"
            UPDATE profiles
            SET daily_usage_count = 0, last_reset_time = $2
            WHERE id = $1 AND last_reset_time < $3
            RETURNING id, is_pro, daily_usage_count, last_reset_time
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(day_start)
        .fetch_optional(&self.pool)
        .await?;

        match reset {
            Some(profile) => {
                tracing::info!("Reset daily usage for profile: {}", id);
                Ok(profile)
            }
            // 已被并发请求重置
            None => self.find(id).await?.ok_or(sqlx::Error::RowNotFound),
        }
    }

    async fn try_consume(
        &self,
        id: &str,
        limit: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<ProfileEntity>, sqlx::Error> {
        let profile = sqlx::query_as::<_, ProfileEntity>(
            r#"
            UPDATE profiles
            SET daily_usage_count = daily_usage_count + 1, last_reset_time = $3
            WHERE id = $1 AND daily_usage_count < $2
            RETURNING id, is_pro, daily_usage_count, last_reset_time
            "#,
        )
        .bind(id)
        .bind(limit)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(profile)
    }
}

/// 进程内存储库，未配置数据库时使用，也用于测试
#[derive(Default)]
pub struct MemoryProfileRepository {
    rows: Mutex<HashMap<String, ProfileEntity>>,
}

impl MemoryProfileRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接写入一行
    pub fn upsert(&self, profile: ProfileEntity) {
        self.rows.lock().insert(profile.id.clone(), profile);
    }
}

#[async_trait]
impl ProfileStore for MemoryProfileRepository {
    async fn find(&self, id: &str) -> Result<Option<ProfileEntity>, sqlx::Error> {
        Ok(self.rows.lock().get(id).cloned())
    }

    async fn create_default(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<ProfileEntity, sqlx::Error> {
        let mut rows = self.rows.lock();
        let profile = rows
            .entry(id.to_string())
            .or_insert_with(|| ProfileEntity::new(id, now));
        Ok(profile.clone())
    }

    async fn reset_usage(
        &self,
        id: &str,
        now: DateTime<Utc>,
        day_start: DateTime<Utc>,
    ) -> Result<ProfileEntity, sqlx::Error> {
        let mut rows = self.rows.lock();
        let profile = rows.get_mut(id).ok_or(sqlx::Error::RowNotFound)?;
        if profile.last_reset_time < day_start {
            profile.daily_usage_count = 0;
            profile.last_reset_time = now;
        }
        Ok(profile.clone())
    }

    async fn try_consume(
        &self,
        id: &str,
        limit: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<ProfileEntity>, sqlx::Error> {
        let mut rows = self.rows.lock();
        let profile = rows.get_mut(id).ok_or(sqlx::Error::RowNotFound)?;
        if profile.daily_usage_count >= limit {
            return Ok(None);
        }
        profile.daily_usage_count += 1;
        profile.last_reset_time = now;
        Ok(Some(profile.clone()))
    }
}
