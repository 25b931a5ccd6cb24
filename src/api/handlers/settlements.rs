use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use super::ApiResponse;
use crate::errors::AppError;
use crate::models::SettlementEvent;
use crate::AppState;

/// Ingress for on-chain settlement events. Events are queued to the
/// settlement consumer rather than applied inline, so feed producers get
/// the same ordering and conflict handling as any other source.
pub async fn submit(
    State(state): State<AppState>,
    Json(event): Json<SettlementEvent>,
) -> Result<Json<ApiResponse<Value>>, AppError> {
    if event.condition_id.is_empty() {
        return Err(AppError::BadRequest("condition_id must not be empty".into()));
    }
    if event.winning_outcome_label.is_none() && event.winning_outcome_index.is_none() {
        return Err(AppError::BadRequest(
            "settlement must carry a winning outcome label or index".into(),
        ));
    }

    let condition_id = event.condition_id.clone();
    state
        .settlement_tx
        .send(event)
        .await
        .map_err(|_| AppError::Internal(anyhow::anyhow!("settlement consumer unavailable")))?;

    Ok(Json(ApiResponse::ok(json!({ "queued": condition_id }))))
}
