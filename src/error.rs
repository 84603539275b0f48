use axum::Json;
use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::utils::error_codes;

/// 会返回给调用方的错误
///
/// 配额/限流拒绝和协调存储故障不在这里，它们在各组件内部被吸收。
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// 上游服务返回的错误，状态码可能属于可重试集合
    #[error("upstream responded with {status}: {message}")]
    Upstream { status: u16, message: String },

    /// 熔断器打开，主动拒绝调用上游
    #[error("circuit open for {operation}, retry after {retry_after_secs}s")]
    CircuitOpen {
        operation: String,
        retry_after_secs: u64,
    },

    /// 并发上游调用已达上限
    #[error("too many in-flight upstream calls")]
    Overloaded,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// 依赖的功能未配置
    #[error("{0} is not configured")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// 上游错误携带的状态码，熔断器据此判断是否计入失败
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            AppError::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::CircuitOpen { .. } | AppError::Overloaded | AppError::Unavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Database(_) | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> i32 {
        match self {
            AppError::Upstream { .. } => error_codes::UPSTREAM_ERROR,
            AppError::CircuitOpen { .. } => error_codes::CIRCUIT_OPEN,
            AppError::Overloaded => error_codes::OVERLOADED,
            AppError::Unavailable(_) => error_codes::UNAVAILABLE,
            AppError::Database(_) | AppError::Internal(_) => error_codes::INTERNAL_ERROR,
        }
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            AppError::CircuitOpen {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            AppError::Overloaded => Some(1),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    code: i32,
    msg: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // 数据库细节不外泄
        let msg = match &self {
            AppError::Database(_) | AppError::Internal(_) => "内部服务器错误".to_string(),
            other => other.to_string(),
        };

        let body = Json(ErrorResponse {
            code: self.code(),
            msg,
        });

        let mut response = (status, body).into_response();
        if let Some(secs) = self.retry_after() {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
