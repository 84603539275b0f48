use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use parking_lot::Mutex;

/// 时间来源
///
/// 限流窗口、熔断超时、配额日切换与进程内 TTL 都从这里取时间，
/// 测试中可以替换为 [`ManualClock`] 手动拨动时间。
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// 系统时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 手动时钟，只在调用 `advance`/`set` 时前进
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// UTC 日期键，例如 `2024-05-01`
pub fn utc_date_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d").to_string()
}

/// 下一个 UTC 零点
pub fn next_utc_midnight(at: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = at.date_naive() + Duration::days(1);
    tomorrow.and_time(NaiveTime::MIN).and_utc()
}
