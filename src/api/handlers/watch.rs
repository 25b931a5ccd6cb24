use axum::extract::{Path, State};
use axum::Json;

use super::ApiResponse;
use crate::db::watch_repo;
use crate::errors::AppError;
use crate::models::WatchedMarket;
use crate::AppState;

pub async fn list(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<WatchedMarket>>>, AppError> {
    let watched = watch_repo::list_watched(&state.db).await?;
    Ok(Json(ApiResponse::ok(watched)))
}

pub async fn register(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<WatchedMarket>>, AppError> {
    if id.is_empty() {
        return Err(AppError::BadRequest("market_id must not be empty".into()));
    }
    let watched = watch_repo::register_interest(&state.db, &id).await?;
    tracing::info!(
        market_id = %watched.market_id,
        interest = watched.active_interest_count,
        "Registered watch interest"
    );
    Ok(Json(ApiResponse::ok(watched)))
}

pub async fn release(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<WatchedMarket>>, AppError> {
    match watch_repo::release_interest(&state.db, &id).await? {
        Some(watched) => Ok(Json(ApiResponse::ok(watched))),
        None => Err(AppError::NotFound(format!("watched market {id}"))),
    }
}
