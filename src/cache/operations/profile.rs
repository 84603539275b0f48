use std::time::Duration;

use crate::cache::keys::profile_cache_key;
use crate::cache::models::CachedProfile;
use crate::store::StoreClient;

/// 用户配额档案缓存操作
///
/// 短 TTL 读缓存，存储不可用时直接退化为每次查询数据库。
pub struct ProfileCacheOperations;

impl ProfileCacheOperations {
    /// 从协调存储获取档案
    pub async fn get_cached_profile(store: &StoreClient, user_id: &str) -> Option<CachedProfile> {
        let client = store.get_client()?;

        let key = profile_cache_key(user_id);
        match client.get(&key).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(profile) => Some(profile),
                Err(e) => {
                    tracing::warn!("Discarding malformed cached profile {}: {}", user_id, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                store.record_error(&e);
                None
            }
        }
    }

    /// 写入档案缓存
    pub async fn cache_profile(store: &StoreClient, profile: &CachedProfile, ttl: Duration) {
        let Some(client) = store.get_client() else {
            return;
        };

        let key = profile_cache_key(&profile.id);
        let json = match serde_json::to_string(profile) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("Failed to serialize profile {}: {}", profile.id, e);
                return;
            }
        };

        if let Err(e) = client.set(&key, &json, Some(ttl)).await {
            store.record_error(&e);
        }
    }

    /// 从缓存中删除档案
    pub async fn remove_cached_profile(store: &StoreClient, user_id: &str) {
        let Some(client) = store.get_client() else {
            return;
        };
        if let Err(e) = client.del(&profile_cache_key(user_id)).await {
            store.record_error(&e);
        }
    }
}
