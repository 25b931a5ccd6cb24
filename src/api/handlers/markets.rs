use axum::extract::{Path, Query, State};
use axum::Json;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::ApiResponse;
use crate::db::market_repo::{self, MarketFilter};
use crate::errors::AppError;
use crate::models::{MarketRecord, ResolutionStatus};
use crate::AppState;

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1_000;

#[derive(Deserialize)]
pub struct MarketListQuery {
    pub resolution_status: Option<String>,
    /// Only markets with a price observed within this many seconds.
    pub fresh_within_secs: Option<f64>,
    #[serde(alias = "min_volume")]
    pub min_volume_24h: Option<Decimal>,
    pub limit: Option<i64>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<MarketListQuery>,
) -> Result<Json<ApiResponse<Vec<MarketRecord>>>, AppError> {
    let resolution_status = match query.resolution_status.as_deref() {
        Some(s) => Some(ResolutionStatus::from_str(s).ok_or_else(|| {
            AppError::BadRequest(format!("unknown resolution_status {s:?}"))
        })?),
        None => None,
    };

    let filter = MarketFilter {
        resolution_status,
        fresh_within_secs: query.fresh_within_secs,
        min_volume_24h: query.min_volume_24h,
        limit: query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
    };

    let markets = market_repo::list_markets(&state.db, &filter).await?;
    Ok(Json(ApiResponse::ok(markets)))
}

pub async fn resolved(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Vec<MarketRecord>>>, AppError> {
    let markets = market_repo::get_resolved_markets(&state.db).await?;
    Ok(Json(ApiResponse::ok(markets)))
}

pub async fn detail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<MarketRecord>>, AppError> {
    match market_repo::get_market(&state.db, &id).await? {
        Some(market) => Ok(Json(ApiResponse::ok(market))),
        None => Err(AppError::NotFound(format!("market {id}"))),
    }
}
