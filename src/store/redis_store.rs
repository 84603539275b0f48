use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, Client as RedisClient, ErrorKind, RedisError, aio::MultiplexedConnection};
use tokio::sync::RwLock;

use super::{KvStore, StoreResult};

/// 条件自增：当前值小于上限时才 INCR，首次自增时设置过期
const INCR_BELOW_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
    return -1
end
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return count
"#;

/// 自增，首次自增时设置过期
const INCR_EXPIRING_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// SCAN 每批建议返回的键数
const SCAN_BATCH: usize = 500;

fn is_connection_error(err: &RedisError) -> bool {
    matches!(err.kind(), ErrorKind::IoError | ErrorKind::BusyLoadingError)
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
}

/// Redis 实现
///
/// 连接在第一次使用时才建立；遇到连接类错误会丢弃，下一次调用重新连接。
pub struct RedisStore {
    client: RedisClient,
    conn: RwLock<Option<MultiplexedConnection>>,
    incr_below: redis::Script,
    incr_expiring: redis::Script,
}

impl RedisStore {
    /// 只校验 URL，不会立即连接
    pub fn open(url: &str) -> Result<Self, RedisError> {
        Ok(Self {
            client: RedisClient::open(url)?,
            conn: RwLock::new(None),
            incr_below: redis::Script::new(INCR_BELOW_SCRIPT),
            incr_expiring: redis::Script::new(INCR_EXPIRING_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, RedisError> {
        if let Some(conn) = self.conn.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let mut slot = self.conn.write().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        tracing::debug!("Opening redis connection");
        let conn = self.client.get_multiplexed_async_connection().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// 记录连接错误并丢弃旧连接
    async fn check<T>(&self, result: Result<T, RedisError>) -> StoreResult<T> {
        match result {
            Ok(v) => Ok(v),
            Err(e) => {
                if is_connection_error(&e) {
                    tracing::warn!("Redis connection error, dropping connection: {}", e);
                    self.conn.write().await.take();
                }
                Err(e.into())
            }
        }
    }
}

fn millis(ttl: Duration) -> i64 {
    ttl.as_millis().max(1) as i64
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.check(self.connection().await).await?;
        let result: Result<Option<String>, _> = conn.get(key).await;
        self.check(result).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.check(self.connection().await).await?;
        let result: Result<(), _> = match ttl {
            Some(ttl) => conn.pset_ex(key, value, millis(ttl) as u64).await,
            None => conn.set(key, value).await,
        };
        self.check(result).await
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.check(self.connection().await).await?;
        let result: Result<(), _> = conn.del(key).await;
        self.check(result).await
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.check(self.connection().await).await?;
        let result: Result<i64, _> = conn.incr(key, 1).await;
        self.check(result).await
    }

    async fn decr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.check(self.connection().await).await?;
        let result: Result<i64, _> = conn.decr(key, 1).await;
        self.check(result).await
    }

    async fn incr_expiring(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let mut conn = self.check(self.connection().await).await?;
        let result: Result<i64, _> = self
            .incr_expiring
            .key(key)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await;
        self.check(result).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.check(self.connection().await).await?;
        let result: Result<(), _> = conn.pexpire(key, millis(ttl)).await;
        self.check(result).await
    }

    async fn incr_below(
        &self,
        key: &str,
        limit: i64,
        ttl: Duration,
    ) -> StoreResult<Option<i64>> {
        let mut conn = self.check(self.connection().await).await?;
        let result: Result<i64, _> = self
            .incr_below
            .key(key)
            .arg(limit)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await;
        let count = self.check(result).await?;
        Ok((count >= 0).then_some(count))
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.check(self.connection().await).await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let result: Result<(u64, Vec<String>), _> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await;
            let (next, batch) = self.check(result).await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN 可能重复返回同一个键
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}
