/// 访客配额计数键前缀
const GUEST_QUOTA_PREFIX: &str = "quota:guest:";

/// 用户配额档案缓存键前缀
const PROFILE_PREFIX: &str = "quota:profile:";

/// 生成访客当日配额计数键
pub fn guest_quota_key(identity: &str, date_key: &str) -> String {
    format!("{}{}:{}", GUEST_QUOTA_PREFIX, identity, date_key)
}

/// 生成用户配额档案缓存键
pub fn profile_cache_key(user_id: &str) -> String {
    format!("{}{}", PROFILE_PREFIX, user_id)
}
