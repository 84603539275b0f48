use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::{
    AppState,
    cache::keys::rate_limit_key,
    clock::Clock,
    middleware::identity::ClientIdentity,
    store::{KvStore, MemoryStore, StoreClient, StoreResult},
    utils::{error_codes, error_to_api_response},
};

/// 计数键在窗口结束后多保留的时间
const EXPIRY_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// 窗口结束时间（Unix 毫秒）
    pub reset_at: i64,
}

/// 固定窗口限流
///
/// 窗口编号为 `floor(now / window)`，跨窗口边界的突发可能短暂超过名义速率。
/// 协调存储不可用时按相同的键在进程内计数，此时每个实例各自限流。
pub struct RateLimiter {
    store: StoreClient,
    fallback: Arc<MemoryStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: StoreClient, fallback: Arc<MemoryStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            fallback,
            clock,
        }
    }

    pub async fn check(&self, identifier: &str, limit: u32, window: Duration) -> RateLimitResult {
        let window_ms = (window.as_millis() as i64).max(1);
        let window_index = self.clock.now_millis().div_euclid(window_ms);
        let key = rate_limit_key(identifier, window_index);
        let ttl = window + EXPIRY_SLACK;

        let count = match self.store.get_client() {
            Some(store) => match increment(store.as_ref(), &key, ttl).await {
                Ok(count) => Some(count),
                Err(e) => {
                    self.store.record_error(&e);
                    None
                }
            },
            None => None,
        };

        let count = match count {
            Some(count) => count,
            None => match increment(self.fallback.as_ref(), &key, ttl).await {
                Ok(count) => count,
                Err(e) => {
                    tracing::warn!("In-process rate limit failed for {}: {}", identifier, e);
                    0
                }
            },
        };

        let count = count.max(0) as u64;
        RateLimitResult {
            allowed: count <= u64::from(limit),
            limit,
            remaining: u64::from(limit).saturating_sub(count) as u32,
            reset_at: (window_index + 1) * window_ms,
        }
    }
}

/// 计数并在窗口第一次请求时设置过期，两步在存储侧原子完成
async fn increment(store: &dyn KvStore, key: &str, ttl: Duration) -> StoreResult<i64> {
    store.incr_expiring(key, ttl).await
}

pub fn create_rate_limit_headers(result: &RateLimitResult) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let reset_secs = (result.reset_at + 999).div_euclid(1000);
    for (name, value) in [
        ("x-ratelimit-limit", result.limit.to_string()),
        ("x-ratelimit-remaining", result.remaining.to_string()),
        ("x-ratelimit-reset", reset_secs.to_string()),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
    headers
}

pub async fn rate_limit(
    State(state): State<AppState>,
    ClientIdentity(identity): ClientIdentity,
    req: Request<Body>,
    next: Next,
) -> Response {
    let identifier = identity.rate_limit_key();
    let limit = state.config.rate_limit_requests;
    let window = state.config.rate_limit_window();

    let result = state
        .monitor
        .measure("rate_limit.check", None, async {
            Ok::<_, Infallible>(state.rate_limiter.check(&identifier, limit, window).await)
        })
        .await;
    let result = match result {
        Ok(result) => result,
        Err(never) => match never {},
    };
    let headers = create_rate_limit_headers(&result);

    if !result.allowed {
        tracing::info!(client = %identifier, "Rate limit exceeded");
        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            error_to_api_response::<()>(
                error_codes::RATE_LIMIT,
                format!("请求过于频繁，请在{}秒后重试", window.as_secs()),
            ),
        )
            .into_response();
        response.headers_mut().extend(headers);
        return response;
    }

    let mut response = next.run(req).await;
    response.headers_mut().extend(headers);
    response
}
