use serde::{Deserialize, Serialize};

use crate::{quota::QuotaStatus, upstream::GenerateResponse};

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResult {
    pub result: GenerateResponse,
    /// 是否来自响应缓存
    pub cached: bool,
    /// 扣减后的配额
    pub quota: QuotaStatus,
}
