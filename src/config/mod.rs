use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub jwt_secret: Option<String>,
    pub upstream_url: Option<String>,
    pub server_host: String,
    pub server_port: u16,
    pub rate_limit_window_secs: u64,
    pub rate_limit_requests: u32,
    pub guest_daily_limit: u32,
    pub user_daily_limit: u32,
    pub breaker_failure_threshold: u32,
    pub breaker_timeout_secs: u64,
    pub breaker_half_open_trials: u32,
    pub store_error_threshold: u32,
    pub store_cooldown_secs: u64,
    pub cache_ttl_secs: u64,
    pub profile_cache_ttl_secs: u64,
    pub max_in_flight: u32,
    pub upstream_timeout_secs: u64,
    pub slow_call_threshold_ms: u64,
    pub metrics_capacity: usize,
}

/// 读取可选变量，空字符串视为未配置
fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Config {
            database_url: optional("DATABASE_URL"),
            redis_url: optional("REDIS_URL"),
            jwt_secret: optional("JWT_SECRET"),
            upstream_url: optional("UPSTREAM_URL"),
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "::".into()),
            server_port: parsed("SERVER_PORT", 3000),
            rate_limit_window_secs: parsed("RATE_LIMIT_WINDOW", 60),
            rate_limit_requests: parsed("RATE_LIMIT_REQUESTS", 100),
            guest_daily_limit: parsed("GUEST_DAILY_LIMIT", 3),
            user_daily_limit: parsed("USER_DAILY_LIMIT", 20),
            breaker_failure_threshold: parsed("BREAKER_FAILURE_THRESHOLD", 5),
            breaker_timeout_secs: parsed("BREAKER_TIMEOUT", 60),
            breaker_half_open_trials: parsed("BREAKER_HALF_OPEN_TRIALS", 3),
            store_error_threshold: parsed("STORE_ERROR_THRESHOLD", 5),
            store_cooldown_secs: parsed("STORE_COOLDOWN", 30),
            cache_ttl_secs: parsed("CACHE_TTL", 3600),
            profile_cache_ttl_secs: parsed("PROFILE_CACHE_TTL", 60),
            max_in_flight: parsed("MAX_IN_FLIGHT", 10),
            upstream_timeout_secs: parsed("UPSTREAM_TIMEOUT", 30),
            slow_call_threshold_ms: parsed("SLOW_CALL_THRESHOLD_MS", 1000),
            metrics_capacity: parsed("METRICS_CAPACITY", 1000),
        }
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn breaker_timeout(&self) -> Duration {
        Duration::from_secs(self.breaker_timeout_secs)
    }

    pub fn store_cooldown(&self) -> Duration {
        Duration::from_secs(self.store_cooldown_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn profile_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.profile_cache_ttl_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn slow_call_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_call_threshold_ms)
    }
}

impl Default for Config {
    /// 不依赖环境变量的默认配置，所有外部依赖都处于未配置状态
    fn default() -> Self {
        Config {
            database_url: None,
            redis_url: None,
            jwt_secret: None,
            upstream_url: None,
            server_host: "::".into(),
            server_port: 3000,
            rate_limit_window_secs: 60,
            rate_limit_requests: 100,
            guest_daily_limit: 3,
            user_daily_limit: 20,
            breaker_failure_threshold: 5,
            breaker_timeout_secs: 60,
            breaker_half_open_trials: 3,
            store_error_threshold: 5,
            store_cooldown_secs: 30,
            cache_ttl_secs: 3600,
            profile_cache_ttl_secs: 60,
            max_in_flight: 10,
            upstream_timeout_secs: 30,
            slow_call_threshold_ms: 1000,
            metrics_capacity: 1000,
        }
    }
}
