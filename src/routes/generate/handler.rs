use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::{
    AppState,
    cache::{CacheOptions, generate_cache_key},
    error::AppError,
    middleware::ClientIdentity,
    upstream::GenerateRequest,
    utils::{
        denied_to_api_response, error_codes, error_to_api_response, success_to_api_response,
    },
};

use super::model::GenerateResult;

/// 熔断器和指标使用的操作名
pub const GENERATE_OPERATION: &str = "generate";

/// 扣减配额，然后经缓存、准入控制、熔断器调用上游
///
/// 配额在调用上游之前扣减，缓存命中和上游失败都不退还。
pub async fn generate(
    State(state): State<AppState>,
    ClientIdentity(identity): ClientIdentity,
    Json(req): Json<GenerateRequest>,
) -> Result<Response, AppError> {
    if req.prompt.trim().is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            error_to_api_response::<()>(error_codes::VALIDATION_ERROR, "prompt 不能为空".into()),
        )
            .into_response());
    }

    let outcome = state
        .monitor
        .measure("quota.consume", None, state.quota.consume(&identity))
        .await?;
    if !outcome.allowed {
        tracing::info!(client = %identity.rate_limit_key(), "Daily quota exhausted");
        return Ok((
            StatusCode::TOO_MANY_REQUESTS,
            denied_to_api_response(
                error_codes::QUOTA_EXCEEDED,
                "今日额度已用完".into(),
                outcome.status,
            ),
        )
            .into_response());
    }

    let key = generate_cache_key(GENERATE_OPERATION, req.cache_params());
    let metadata = serde_json::json!({ "plan": outcome.status.plan });
    let (result, cached) = state
        .monitor
        .measure(
            GENERATE_OPERATION,
            Some(metadata),
            state
                .cache
                .wrap_with_hit(&key, CacheOptions::default(), || async {
                    state
                        .admission
                        .run(|| {
                            state
                                .breaker
                                .run(GENERATE_OPERATION, None, || state.upstream.generate(&req))
                        })
                        .await
                }),
        )
        .await?;

    Ok(success_to_api_response(GenerateResult {
        result,
        cached,
        quota: outcome.status,
    })
    .into_response())
}
