//! 上游生成服务客户端

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::AppError;

/// 上游错误信息保留的最大字符数，原始响应体可能是整页 HTML
const MAX_ERROR_MESSAGE_CHARS: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub prompt: String,
    /// 透传给上游的参数，同时参与缓存键计算
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl GenerateRequest {
    /// 参与缓存键计算的参数
    pub fn cache_params(&self) -> Vec<(String, String)> {
        let mut params = vec![("prompt".to_string(), self.prompt.clone())];
        params.extend(
            self.options
                .iter()
                .map(|(k, v)| (format!("options.{}", k), v.to_string())),
        );
        params
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub output: serde_json::Value,
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, AppError>;
}

/// 通过 HTTP 调用上游
///
/// 未配置地址时每次调用都返回 [`AppError::Unavailable`]。
pub struct GenerationClient {
    client: Client,
    url: Option<String>,
}

impl GenerationClient {
    pub fn new(url: Option<String>, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build http client: {}", e)))?;
        Ok(Self { client, url })
    }

    pub fn from_config(config: &Config) -> Result<Self, AppError> {
        Self::new(config.upstream_url.clone(), config.upstream_timeout())
    }
}

#[async_trait]
impl Generator for GenerationClient {
    async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, AppError> {
        let Some(url) = self.url.as_deref() else {
            return Err(AppError::Unavailable("upstream".into()));
        };

        let resp = self
            .client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        let text = resp.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(AppError::Upstream {
                status: status.as_u16(),
                message: truncate_message(&text),
            });
        }

        serde_json::from_str::<GenerateResponse>(&text).map_err(|e| AppError::Upstream {
            status: 502,
            message: format!("malformed upstream response: {}", e),
        })
    }
}

fn truncate_message(text: &str) -> String {
    match text.char_indices().nth(MAX_ERROR_MESSAGE_CHARS) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

/// 超时按 504，其余网络错误按 502，两者都会计入熔断
fn transport_error(err: reqwest::Error) -> AppError {
    let status = if err.is_timeout() { 504 } else { 502 };
    AppError::Upstream {
        status,
        message: err.to_string(),
    }
}
