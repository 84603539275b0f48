use axum::{extract::State, response::IntoResponse};

use crate::{
    AppState, error::AppError, middleware::ClientIdentity, utils::success_to_api_response,
};

/// 查询当前调用方的配额，不消耗额度
pub async fn get_quota(
    State(state): State<AppState>,
    ClientIdentity(identity): ClientIdentity,
) -> Result<impl IntoResponse, AppError> {
    let status = state
        .monitor
        .measure("quota.status", None, state.quota.status(&identity))
        .await?;
    Ok(success_to_api_response(status))
}
