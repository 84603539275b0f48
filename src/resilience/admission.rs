//! 上游并发准入
//!
//! 全局在途调用数保存在协调存储的共享计数器里；存储不可用时退化为进程内计数。
//! 每次成功占位都必须有且只有一次对应的释放，包括错误返回和请求被取消的情况。

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::cache::keys::IN_FLIGHT_KEY;
use crate::error::AppError;
use crate::store::{KvStore, StoreClient};

/// 共享计数器的过期时间，泄漏的计数最终会被清掉
const IN_FLIGHT_TTL: Duration = Duration::from_secs(300);

pub struct AdmissionControl {
    store: StoreClient,
    local: Arc<AtomicI64>,
    max_in_flight: u32,
}

enum Slot {
    Shared(Arc<dyn KvStore>),
    Local,
}

/// 一个已占用的名额，drop 时若尚未释放则补偿扣减
struct Permit {
    slot: Option<Slot>,
    store: StoreClient,
    local: Arc<AtomicI64>,
}

impl Permit {
    async fn release(mut self) {
        if let Some(slot) = self.slot.take() {
            release_slot(&self.store, &self.local, slot).await;
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        match slot {
            Slot::Local => {
                self.local.fetch_sub(1, Ordering::SeqCst);
            }
            // 请求被取消，异步补偿
            Slot::Shared(store) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let client = self.store.clone();
                    let local = self.local.clone();
                    handle.spawn(async move {
                        release_slot(&client, &local, Slot::Shared(store)).await;
                    });
                }
                Err(_) => tracing::warn!("Leaked an in-flight slot, no runtime to release it"),
            },
        }
    }
}

async fn release_slot(client: &StoreClient, local: &AtomicI64, slot: Slot) {
    match slot {
        Slot::Shared(store) => {
            if let Err(e) = store.decr(IN_FLIGHT_KEY).await {
                client.record_error(&e);
            }
        }
        Slot::Local => {
            local.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl AdmissionControl {
    pub fn new(store: StoreClient, max_in_flight: u32) -> Self {
        Self {
            store,
            local: Arc::new(AtomicI64::new(0)),
            max_in_flight,
        }
    }

    /// 占到名额后执行 `work`，名额已满时返回 [`AppError::Overloaded`]
    pub async fn run<T, F, Fut>(&self, work: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let permit = self.acquire().await?;
        let result = work().await;
        permit.release().await;
        result
    }

    async fn acquire(&self) -> Result<Permit, AppError> {
        let max = i64::from(self.max_in_flight);

        if let Some(store) = self.store.get_client() {
            match store.incr(IN_FLIGHT_KEY).await {
                Ok(count) => {
                    if let Err(e) = store.expire(IN_FLIGHT_KEY, IN_FLIGHT_TTL).await {
                        self.store.record_error(&e);
                    }
                    let permit = self.permit(Slot::Shared(store));
                    if count > max {
                        permit.release().await;
                        tracing::warn!(in_flight = count - 1, max, "Upstream call rejected, too many in flight");
                        return Err(AppError::Overloaded);
                    }
                    return Ok(permit);
                }
                Err(e) => self.store.record_error(&e),
            }
        }

        let count = self.local.fetch_add(1, Ordering::SeqCst) + 1;
        let permit = self.permit(Slot::Local);
        if count > max {
            permit.release().await;
            tracing::warn!(in_flight = count - 1, max, "Upstream call rejected, too many in flight locally");
            return Err(AppError::Overloaded);
        }
        Ok(permit)
    }

    fn permit(&self, slot: Slot) -> Permit {
        Permit {
            slot: Some(slot),
            store: self.store.clone(),
            local: self.local.clone(),
        }
    }

    /// 当前在途调用数，优先读共享计数器
    pub async fn in_flight(&self) -> i64 {
        if let Some(store) = self.store.get_client() {
            match store.get(IN_FLIGHT_KEY).await {
                Ok(value) => {
                    return value.and_then(|v| v.parse().ok()).unwrap_or(0);
                }
                Err(e) => self.store.record_error(&e),
            }
        }
        self.local.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight
    }
}
