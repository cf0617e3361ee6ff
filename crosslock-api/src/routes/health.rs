use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::models::HealthResponse;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let store_reachable = state.storage.is_reachable().await;
    let swaps_by_status = state.storage.count_by_status().await.unwrap_or_default();
    let evm = serde_json::to_value(&*state.evm_health.read().await).unwrap_or_default();
    let move_chain = serde_json::to_value(&*state.move_health.read().await).unwrap_or_default();

    Json(HealthResponse {
        status: if store_reachable { "ok" } else { "degraded" },
        version: crosslock_core::CROSSLOCK_VERSION,
        store_reachable,
        subscribers: state.hub.subscriber_count(),
        swaps_by_status,
        evm,
        move_chain,
    })
}
