use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    RequestPartsExt,
    extract::{ConnectInfo, FromRequestParts},
    http::request::Parts,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};

use crate::{AppState, quota::Identity, utils::verify_token};

/// 匿名调用方的指纹请求头
pub const FINGERPRINT_HEADER: &str = "x-fingerprint";

/// 解析出的调用方身份
///
/// 有效的 Bearer 令牌视为注册用户，否则按 指纹 > IP > 哨兵 识别访客。
/// 令牌无效时不拒绝请求，按访客处理。
#[derive(Debug, Clone)]
pub struct ClientIdentity(pub Identity);

impl FromRequestParts<AppState> for ClientIdentity {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(secret) = state.config.jwt_secret.as_deref() {
            if let Ok(TypedHeader(Authorization(bearer))) =
                parts.extract::<TypedHeader<Authorization<Bearer>>>().await
            {
                match verify_token(bearer.token(), secret) {
                    Ok(claims) => return Ok(ClientIdentity(Identity::Registered(claims.sub))),
                    Err(e) => tracing::debug!("Ignoring invalid bearer token: {}", e),
                }
            }
        }

        let fingerprint = parts
            .headers
            .get(FINGERPRINT_HEADER)
            .and_then(|h| h.to_str().ok());
        let ip = client_ip(parts);

        Ok(ClientIdentity(Identity::anonymous(fingerprint, ip.as_deref())))
    }
}

/// 从请求头获取IP，否则使用连接信息中的IP
pub fn client_ip(parts: &Parts) -> Option<String> {
    let remote_ip = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string());

    parts
        .headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .or_else(|| {
            parts
                .headers
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.split(',').find(|ip| !ip.trim().is_empty()))
        })
        .map(|ip| ip.trim().to_string())
        .or(remote_ip)
}
