use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;

use crosslock_core::swap::SwapStatus;
use crosslock_core::SwapSession;

use crate::error::ApiError;
use crate::models::{ApiResponse, RefundResponse, SwapListParams};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/swaps", get(list_swaps))
        .route("/swaps/:swap_id", get(get_swap))
        .route("/refund/:swap_id", post(force_refund))
}

async fn list_swaps(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SwapListParams>,
) -> Result<Json<ApiResponse<Vec<SwapSession>>>, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(SwapStatus::from_str)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let offset = params.offset.unwrap_or(0).max(0);

    // Admin polls hit this often; short-lived cache keeps the store quiet.
    let cache_key = format!("swaps:{:?}:{limit}:{offset}", params.status);
    if let Some(cached) = state.cache.get_query(&cache_key) {
        let swaps: Vec<SwapSession> = serde_json::from_value(cached)
            .map_err(|e| ApiError::Internal(e.into()))?;
        return Ok(Json(ApiResponse::ok(swaps)));
    }

    let swaps = state.storage.list_swaps(status, limit, offset).await?;
    if let Ok(value) = serde_json::to_value(&swaps) {
        state.cache.set_query(cache_key, value);
    }
    Ok(Json(ApiResponse::ok(swaps)))
}

async fn get_swap(
    State(state): State<Arc<AppState>>,
    Path(swap_id): Path<String>,
) -> Result<Json<ApiResponse<SwapSession>>, ApiError> {
    if let Some(swap) = state.cache.get_swap(&swap_id) {
        return Ok(Json(ApiResponse::ok(swap)));
    }
    let swap = state
        .storage
        .load_swap(&swap_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("swap {swap_id}")))?;
    Ok(Json(ApiResponse::ok(swap)))
}

/// Operator-forced refund. The relayer never refunds on its own; this is
/// the explicit admin path, allowed only once the timelock has passed.
async fn force_refund(
    State(state): State<Arc<AppState>>,
    Path(swap_id): Path<String>,
) -> Result<Json<ApiResponse<RefundResponse>>, ApiError> {
    let swap = state
        .storage
        .load_swap(&swap_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("swap {swap_id}")))?;

    if swap.status.is_terminal() && swap.status != SwapStatus::Failed {
        return Err(ApiError::Conflict(format!(
            "swap {swap_id} is {}; nothing to refund",
            swap.status
        )));
    }
    if swap.expires_at > Utc::now() {
        return Err(ApiError::Conflict(format!(
            "swap {swap_id} timelock has not passed yet"
        )));
    }

    let sides = [
        (crosslock_core::Chain::Evm, swap.evm_contract_id.clone()),
        (crosslock_core::Chain::Move, swap.move_contract_id.clone()),
    ];
    let mut tx_hashes = Vec::new();
    for (chain, contract_id) in sides {
        let Some(contract_id) = contract_id else {
            continue;
        };
        let tx_hash = state
            .executor
            .refund(chain, &contract_id)
            .await
            .map_err(|e| ApiError::Upstream(e.to_string()))?;
        tracing::info!("forced refund for swap {swap_id} on {chain}: {tx_hash}");
        tx_hashes.push(tx_hash);
    }
    if tx_hashes.is_empty() {
        return Err(ApiError::Conflict(format!(
            "swap {swap_id} has no locked side to refund"
        )));
    }

    // No partition serializes this admin write; the repository's
    // compare-and-set keeps it from clobbering the coordinator.
    let first_tx = tx_hashes[0].clone();
    let updated = state
        .storage
        .update_swap(&swap_id, move |s| {
            if s.status.can_transition_to(SwapStatus::Refunded) {
                s.refund_tx_hash = Some(first_tx.clone());
                s.transition(SwapStatus::Refunded)
            } else {
                // Terminal (FAILED) swaps are absorbing: only the error log
                // may record the operator action.
                s.push_error(format!("operator refund submitted: {first_tx}"));
                Ok(())
            }
        })
        .await?;
    state.cache.set_swap(updated);
    state.cache.invalidate_queries();

    Ok(Json(ApiResponse::ok(RefundResponse {
        swap_id,
        refund_tx_hashes: tx_hashes,
    })))
}
