use axum::{
    Router,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
};
use tower::ServiceBuilder;

use crate::{
    AppState,
    middleware::{log_errors, rate_limit},
};

pub mod generate;
pub mod health;
pub mod quota;

/// 创建主路由，所有路由都经过限流
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/quota", get(quota::get_quota))
        .route("/generate", post(generate::generate))
        .layer(
            ServiceBuilder::new()
                .layer(from_fn(log_errors))
                .layer(from_fn_with_state(state.clone(), rate_limit)),
        )
        .with_state(state)
}
