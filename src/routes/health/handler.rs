use axum::{extract::State, response::IntoResponse};

use crate::{AppState, routes::generate::GENERATE_OPERATION, utils::success_to_api_response};

use super::model::HealthResponse;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.store.stats();
    let status = if state.store.is_configured() && !store.enabled {
        "degraded"
    } else {
        "ok"
    };

    let circuits = state
        .breaker
        .get_stats(GENERATE_OPERATION)
        .await
        .into_iter()
        .collect();

    success_to_api_response(HealthResponse {
        status,
        store,
        cache: state.cache.stats(),
        circuits,
        in_flight: state.admission.in_flight().await,
        max_in_flight: state.admission.max_in_flight(),
        metrics: state.monitor.summary(),
    })
}
