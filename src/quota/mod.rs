//! 分级每日配额
//!
//! - 访客：协调存储中的计数键 `quota:guest:{id}:{date}`，UTC 零点过期
//! - 注册用户：数据库 profiles 表，前面有一层短 TTL 的读缓存
//! - Pro 用户：不限量，也不计数
//!
//! 两条路径的“检查并加一”都是单次原子操作（存储侧脚本 / 条件 UPDATE），
//! 并发请求不会把用量推过上限。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::keys::guest_quota_key;
use crate::cache::models::CachedProfile;
use crate::cache::operations::ProfileCacheOperations;
use crate::clock::{Clock, next_utc_midnight, utc_date_key};
use crate::config::Config;
use crate::database::ProfileStore;
use crate::error::AppError;
use crate::store::{KvStore, MemoryStore, StoreClient, StoreResult};

/// 无法识别访客时使用的哨兵标识
pub const ANONYMOUS: &str = "anonymous";

/// 调用方身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// 指纹、IP 或哨兵
    Guest(String),
    /// 已注册用户 ID
    Registered(String),
}

impl Identity {
    /// 按 指纹 > IP > 哨兵 的顺序选出访客标识
    pub fn anonymous(fingerprint: Option<&str>, ip: Option<&str>) -> Self {
        let key = fingerprint
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| ip.map(str::trim).filter(|v| !v.is_empty()))
            .unwrap_or(ANONYMOUS);
        Identity::Guest(key.to_string())
    }

    /// 限流使用的标识
    pub fn rate_limit_key(&self) -> String {
        match self {
            Identity::Guest(id) => format!("guest:{}", id),
            Identity::Registered(id) => format!("user:{}", id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Guest,
    User,
    Pro,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub plan: Plan,
    /// Pro 为空
    pub limit: Option<u32>,
    /// Pro 为空
    pub remaining: Option<u32>,
    pub used: u32,
    pub is_pro: bool,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    pub status: QuotaStatus,
}

#[derive(Debug, Clone, Copy)]
pub struct QuotaLimits {
    pub guest: u32,
    pub user: u32,
}

impl QuotaLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            guest: config.guest_daily_limit,
            user: config.user_daily_limit,
        }
    }
}

pub struct QuotaAccountant {
    store: StoreClient,
    fallback: Arc<MemoryStore>,
    profiles: Arc<dyn ProfileStore>,
    clock: Arc<dyn Clock>,
    limits: QuotaLimits,
    profile_cache_ttl: Duration,
}

impl QuotaAccountant {
    pub fn new(
        store: StoreClient,
        fallback: Arc<MemoryStore>,
        profiles: Arc<dyn ProfileStore>,
        clock: Arc<dyn Clock>,
        limits: QuotaLimits,
        profile_cache_ttl: Duration,
    ) -> Self {
        Self {
            store,
            fallback,
            profiles,
            clock,
            limits,
            profile_cache_ttl,
        }
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    pub async fn status(&self, identity: &Identity) -> Result<QuotaStatus, AppError> {
        match identity {
            Identity::Guest(id) => {
                let count = self.guest_count(id).await;
                Ok(self.limited_status(Plan::Guest, self.limits.guest, count))
            }
            Identity::Registered(id) => {
                let profile = self.load_profile(id).await?;
                Ok(self.profile_status(&profile))
            }
        }
    }

    pub async fn consume(&self, identity: &Identity) -> Result<ConsumeOutcome, AppError> {
        match identity {
            Identity::Guest(id) => Ok(self.consume_guest(id).await),
            Identity::Registered(id) => self.consume_registered(id).await,
        }
    }

    // ---- 访客 ----

    fn guest_key(&self, id: &str) -> String {
        guest_quota_key(id, &utc_date_key(self.clock.now()))
    }

    async fn guest_count(&self, id: &str) -> u32 {
        let key = self.guest_key(id);
        if let Some(store) = self.store.get_client() {
            match read_count(store.as_ref(), &key).await {
                Ok(count) => return count,
                Err(e) => self.store.record_error(&e),
            }
        }
        read_count(self.fallback.as_ref(), &key)
            .await
            .unwrap_or_default()
    }

    async fn consume_guest(&self, id: &str) -> ConsumeOutcome {
        let key = self.guest_key(id);
        let limit = i64::from(self.limits.guest);
        let now = self.clock.now();
        let ttl = (next_utc_midnight(now) - now)
            .to_std()
            .unwrap_or(Duration::from_secs(1));

        let remote = match self.store.get_client() {
            Some(store) => match store.incr_below(&key, limit, ttl).await {
                Ok(result) => Some(result),
                Err(e) => {
                    self.store.record_error(&e);
                    None
                }
            },
            None => None,
        };

        let consumed = match remote {
            Some(result) => result,
            None => match self.fallback.incr_below(&key, limit, ttl).await {
                Ok(result) => result,
                Err(e) => {
                    // 本地计数异常时放行
                    tracing::warn!("In-process guest quota failed for {}: {}", id, e);
                    let status =
                        self.limited_status(Plan::Guest, self.limits.guest, self.guest_count(id).await);
                    return ConsumeOutcome {
                        allowed: true,
                        status,
                    };
                }
            },
        };

        match consumed {
            Some(count) => ConsumeOutcome {
                allowed: true,
                status: self.limited_status(Plan::Guest, self.limits.guest, count as u32),
            },
            None => {
                tracing::debug!("Guest quota exhausted for {}", id);
                let count = self.guest_count(id).await.max(self.limits.guest);
                ConsumeOutcome {
                    allowed: false,
                    status: self.limited_status(Plan::Guest, self.limits.guest, count),
                }
            }
        }
    }

    // ---- 注册用户 ----

    /// 读取档案（缓存 > 数据库 > 首次创建），跨日时先清零
    async fn load_profile(&self, user_id: &str) -> Result<CachedProfile, AppError> {
        let now = self.clock.now();

        let profile = match ProfileCacheOperations::get_cached_profile(&self.store, user_id).await {
            Some(profile) => profile,
            None => {
                let entity = match self.profiles.find(user_id).await? {
                    Some(entity) => entity,
                    None => self.profiles.create_default(user_id, now).await?,
                };
                let profile = CachedProfile::from(entity);
                self.cache_profile(&profile).await;
                profile
            }
        };

        if utc_date_key(profile.last_reset_time) == utc_date_key(now) {
            return Ok(profile);
        }

        let day_start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        let reset = CachedProfile::from(self.profiles.reset_usage(user_id, now, day_start).await?);
        self.cache_profile(&reset).await;
        Ok(reset)
    }

    async fn consume_registered(&self, user_id: &str) -> Result<ConsumeOutcome, AppError> {
        let profile = self.load_profile(user_id).await?;

        if profile.is_pro {
            return Ok(ConsumeOutcome {
                allowed: true,
                status: self.profile_status(&profile),
            });
        }

        let limit = self.limits.user;
        if profile.daily_usage_count >= limit as i32 {
            return Ok(ConsumeOutcome {
                allowed: false,
                status: self.profile_status(&profile),
            });
        }

        let updated = match self
            .profiles
            .try_consume(user_id, limit as i32, self.clock.now())
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                ProfileCacheOperations::remove_cached_profile(&self.store, user_id).await;
                return Err(e.into());
            }
        };

        match updated {
            Some(entity) => {
                let profile = CachedProfile::from(entity);
                self.cache_profile(&profile).await;
                Ok(ConsumeOutcome {
                    allowed: true,
                    status: self.profile_status(&profile),
                })
            }
            None => {
                // 缓存落后于数据库，以数据库为准
                tracing::debug!("User quota exhausted for {}", user_id);
                let current = match self.profiles.find(user_id).await? {
                    Some(entity) => CachedProfile::from(entity),
                    None => profile,
                };
                self.cache_profile(&current).await;
                Ok(ConsumeOutcome {
                    allowed: false,
                    status: self.profile_status(&current),
                })
            }
        }
    }

    async fn cache_profile(&self, profile: &CachedProfile) {
        ProfileCacheOperations::cache_profile(&self.store, profile, self.profile_cache_ttl).await;
    }

    // ---- 状态 ----

    fn limited_status(&self, plan: Plan, limit: u32, used: u32) -> QuotaStatus {
        QuotaStatus {
            plan,
            limit: Some(limit),
            remaining: Some(limit.saturating_sub(used)),
            used,
            is_pro: false,
            reset_at: next_utc_midnight(self.clock.now()),
        }
    }

    fn profile_status(&self, profile: &CachedProfile) -> QuotaStatus {
        let used = profile.daily_usage_count.max(0) as u32;
        if profile.is_pro {
            return QuotaStatus {
                plan: Plan::Pro,
                limit: None,
                remaining: None,
                used,
                is_pro: true,
                reset_at: next_utc_midnight(self.clock.now()),
            };
        }
        self.limited_status(Plan::User, self.limits.user, used)
    }
}

async fn read_count(store: &dyn KvStore, key: &str) -> StoreResult<u32> {
    Ok(store
        .get(key)
        .await?
        .and_then(|v| v.parse().ok())
        .unwrap_or(0))
}
