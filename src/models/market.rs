use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{MarketStatus, ResolutionStatus};

/// Database row for the market_records table — the canonical record per
/// market that all consumers read.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MarketRecord {
    pub market_id: String,
    pub condition_id: Option<String>,
    pub title: Option<String>,
    pub slug: Option<String>,
    pub outcomes: Vec<String>,
    pub outcome_prices: Vec<Decimal>,
    pub status: String,
    pub resolution_status: String,
    pub winning_outcome: Option<i32>,
    pub end_date: Option<DateTime<Utc>>,
    pub tradeable: bool,
    pub accepting_orders: bool,
    pub volume: Decimal,
    pub volume_24h: Decimal,
    pub liquidity: Decimal,
    pub event_id: Option<String>,
    pub event_title: Option<String>,
    pub event_volume: Option<Decimal>,
    pub token_ids: Vec<String>,
    pub price_source: Option<String>,
    pub price_updated_at: Option<DateTime<Utc>>,
    pub last_trade_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MarketRecord {
    pub fn is_resolved(&self) -> bool {
        self.resolution_status == ResolutionStatus::Resolved.as_str()
    }
}

/// Event-group reference clustering sibling markets under a parent. Never
/// constructed with an empty id; absence of event data in a fetch means
/// "leave the stored association alone", so the patch carries `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventGroup {
    pub event_id: String,
    pub event_title: Option<String>,
    pub event_volume: Option<Decimal>,
}

/// A partial record from one source. `None` fields are left untouched by
/// the upsert; present fields are merged under per-field precedence rules.
#[derive(Debug, Clone, Default)]
pub struct MarketPatch {
    pub market_id: String,
    pub condition_id: Option<String>,
    pub title: Option<String>,
    pub slug: Option<String>,
    pub outcomes: Option<Vec<String>>,
    pub outcome_prices: Option<Vec<Decimal>>,
    pub status: Option<MarketStatus>,
    pub resolution_status: Option<ResolutionStatus>,
    pub winning_outcome: Option<i32>,
    pub end_date: Option<DateTime<Utc>>,
    pub tradeable: Option<bool>,
    pub accepting_orders: Option<bool>,
    pub volume: Option<Decimal>,
    pub volume_24h: Option<Decimal>,
    pub liquidity: Option<Decimal>,
    pub event_group: Option<EventGroup>,
    pub token_ids: Option<Vec<String>>,
    pub last_trade_at: Option<DateTime<Utc>>,
}

impl MarketPatch {
    pub fn new(market_id: impl Into<String>) -> Self {
        Self {
            market_id: market_id.into(),
            ..Default::default()
        }
    }
}

/// Lightweight row used by the tier scheduler: just enough to bucket a
/// market without pulling the full record.
#[derive(Debug, Clone, FromRow)]
pub struct MarketSummary {
    pub market_id: String,
    pub volume_24h: Decimal,
    pub end_date: Option<DateTime<Utc>>,
    pub resolved: bool,
}

/// Outcome of a single upsert: whether any field actually changed value.
/// `updated_at` is only bumped when `changed` is true, so freshness queries
/// reflect real change rather than churn.
#[derive(Debug, Clone, Copy)]
pub struct UpsertResult {
    pub changed: bool,
}
