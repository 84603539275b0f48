use std::collections::BTreeMap;
use std::fmt::Display;

use sha2::{Digest, Sha256};

/// 响应缓存命名空间
pub const CACHE_NAMESPACE: &str = "cache:";

/// 摘要保留的十六进制字符数
const DIGEST_LEN: usize = 32;

/// 根据前缀和参数生成确定性的缓存键
///
/// 参数按键名排序后拼接成 `k:v` 再取摘要，因此与参数顺序无关。
pub fn generate_cache_key<I, K, V>(prefix: &str, params: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Display,
{
    let sorted: BTreeMap<String, String> = params
        .into_iter()
        .map(|(k, v)| (k.into(), v.to_string()))
        .collect();

    let joined = sorted
        .iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect::<Vec<_>>()
        .join("|");

    let digest = format!("{:x}", Sha256::digest(joined.as_bytes()));
    format!("{}:{}", prefix, &digest[..DIGEST_LEN])
}

/// 存储中实际使用的键
pub fn cache_entry_key(key: &str) -> String {
    format!("{}{}", CACHE_NAMESPACE, key)
}
