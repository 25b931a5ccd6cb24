use rust_decimal::Decimal;
use sqlx::PgPool;
use std::str::FromStr;
use thiserror::Error;

use crate::models::{MarketPatch, MarketRecord, MarketSummary, ResolutionStatus, Source, UpsertResult};

/// How long a stream-sourced price outranks a catalog-sourced one.
pub const STREAM_PRICE_FRESH_SECS: f64 = 60.0;

/// Allowed drift of a non-empty price array's sum away from 1.0.
const PRICE_SUM_TOLERANCE: &str = "0.05";

#[derive(Debug, Error)]
pub enum StoreError {
    /// A patch that breaks a record invariant. This is a logic defect in a
    /// writer, not an upstream data problem; it is rejected, never persisted.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Validate a patch against the record invariants before it reaches the
/// database. Free function so writer tests can exercise it directly.
pub fn validate_patch(patch: &MarketPatch) -> Result<(), StoreError> {
    if patch.market_id.is_empty() {
        return Err(StoreError::InvariantViolation("empty market_id".into()));
    }

    if let (Some(outcomes), Some(prices)) = (&patch.outcomes, &patch.outcome_prices) {
        if !prices.is_empty() && prices.len() != outcomes.len() {
            return Err(StoreError::InvariantViolation(format!(
                "price array length {} does not match {} outcomes",
                prices.len(),
                outcomes.len()
            )));
        }
    }

    if let Some(prices) = &patch.outcome_prices {
        if !prices.is_empty() {
            let sum: Decimal = prices.iter().sum();
            let tolerance = Decimal::from_str(PRICE_SUM_TOLERANCE).unwrap_or_default();
            if (sum - Decimal::ONE).abs() > tolerance {
                return Err(StoreError::InvariantViolation(format!(
                    "outcome prices sum to {sum}, expected ≈1"
                )));
            }
        }
    }

    match (patch.resolution_status, patch.winning_outcome) {
        (Some(ResolutionStatus::Resolved), None) => {
            return Err(StoreError::InvariantViolation(
                "resolved without winning outcome".into(),
            ));
        }
        (Some(ResolutionStatus::Resolved), Some(idx)) => {
            if idx < 0 {
                return Err(StoreError::InvariantViolation(format!(
                    "negative winning outcome index {idx}"
                )));
            }
            if let Some(outcomes) = &patch.outcomes {
                if idx as usize >= outcomes.len() {
                    return Err(StoreError::InvariantViolation(format!(
                        "winning outcome index {idx} out of range for {} outcomes",
                        outcomes.len()
                    )));
                }
            }
        }
        (Some(_), Some(_)) | (None, Some(_)) => {
            return Err(StoreError::InvariantViolation(
                "winning outcome set while not resolved".into(),
            ));
        }
        _ => {}
    }

    Ok(())
}

/// The single merge entry point all three writers funnel through.
///
/// One conditional `INSERT .. ON CONFLICT .. DO UPDATE .. WHERE` statement
/// applies per-field precedence atomically, so concurrent poller/streamer/
/// settlement writes cannot lose updates. The `DO UPDATE` fires only when at
/// least one field would actually change value; `rows_affected == 0` means
/// the patch was a no-op and `updated_at` stays untouched.
///
/// Precedence encoded below:
/// - resolution fields: the chain source always wins; the catalog can never
///   revert a resolved record.
/// - prices: a catalog price is ignored while a stream-sourced price is
///   still inside its freshness window.
/// - event group: written only when the patch carries a non-empty group, so
///   an event-less fetch never clears an existing association.
/// - status: `closed` is terminal; a later `active` never reopens it.
/// - last_trade_at: only moves forward.
/// - everything else: last present value wins.
pub async fn upsert(
    pool: &PgPool,
    patch: &MarketPatch,
    source: Source,
) -> Result<UpsertResult, StoreError> {
    validate_patch(patch)?;

    let (event_id, event_title, event_volume) = match &patch.event_group {
        Some(g) => (
            Some(g.event_id.as_str()),
            g.event_title.as_deref(),
            g.event_volume,
        ),
        None => (None, None, None),
    };

    let result = sqlx::query(
        r#"
        INSERT INTO market_records AS m (
            market_id, condition_id, title, slug,
            outcomes, outcome_prices,
            status, resolution_status, winning_outcome,
            end_date, tradeable, accepting_orders,
            volume, volume_24h, liquidity,
            event_id, event_title, event_volume,
            token_ids, price_source, price_updated_at, last_trade_at,
            created_at, updated_at
        )
        VALUES (
            $1, $2, $3, $4,
            COALESCE($5, ARRAY[]::TEXT[]),
            COALESCE($6, ARRAY[]::NUMERIC[]),
            COALESCE($7, 'active'),
            COALESCE($8, 'pending'),
            $9,
            $10, COALESCE($11, TRUE), COALESCE($12, TRUE),
            COALESCE($13, 0), COALESCE($14, 0), COALESCE($15, 0),
            $16, $17, $18,
            COALESCE($19, ARRAY[]::TEXT[]),
            CASE WHEN $6 IS NOT NULL THEN $20 END,
            CASE WHEN $6 IS NOT NULL THEN NOW() END,
            $22,
            NOW(), NOW()
        )
        ON CONFLICT (market_id) DO UPDATE SET
            condition_id = COALESCE($2, m.condition_id),
            title = COALESCE($3, m.title),
            slug = COALESCE($4, m.slug),
            outcomes = COALESCE($5, m.outcomes),
            outcome_prices = CASE
                WHEN $6 IS NOT NULL
                     AND NOT ($20 = 'catalog' AND m.price_source = 'stream'
                              AND m.price_updated_at > NOW() - make_interval(secs => $21))
                THEN $6 ELSE m.outcome_prices END,
            price_source = CASE
                WHEN $6 IS NOT NULL
                     AND NOT ($20 = 'catalog' AND m.price_source = 'stream'
                              AND m.price_updated_at > NOW() - make_interval(secs => $21))
                     AND $6 IS DISTINCT FROM m.outcome_prices
                THEN $20 ELSE m.price_source END,
            price_updated_at = CASE
                WHEN $6 IS NOT NULL
                     AND NOT ($20 = 'catalog' AND m.price_source = 'stream'
                              AND m.price_updated_at > NOW() - make_interval(secs => $21))
                     AND $6 IS DISTINCT FROM m.outcome_prices
                THEN NOW() ELSE m.price_updated_at END,
            -- closed is terminal: the catalog has no dedicated reopen
            -- signal, and a bare closed=false on a closed record is
            -- indistinguishable from a stale payload.
            status = CASE
                WHEN $7 IS NOT NULL AND NOT (m.status = 'closed' AND $7 = 'active')
                THEN $7 ELSE m.status END,
            resolution_status = CASE
                WHEN $8 IS NOT NULL AND ($20 = 'chain' OR m.resolution_status <> 'resolved')
                THEN $8 ELSE m.resolution_status END,
            winning_outcome = CASE
                WHEN $8 IS NOT NULL AND ($20 = 'chain' OR m.resolution_status <> 'resolved')
                THEN $9 ELSE m.winning_outcome END,
            end_date = COALESCE($10, m.end_date),
            tradeable = COALESCE($11, m.tradeable),
            accepting_orders = COALESCE($12, m.accepting_orders),
            volume = COALESCE($13, m.volume),
            volume_24h = COALESCE($14, m.volume_24h),
            liquidity = COALESCE($15, m.liquidity),
            event_id = COALESCE($16, m.event_id),
            event_title = CASE WHEN $16 IS NOT NULL THEN $17 ELSE m.event_title END,
            event_volume = CASE WHEN $16 IS NOT NULL THEN $18 ELSE m.event_volume END,
            token_ids = COALESCE($19, m.token_ids),
            last_trade_at = CASE
                WHEN $22 IS NOT NULL AND (m.last_trade_at IS NULL OR $22 > m.last_trade_at)
                THEN $22 ELSE m.last_trade_at END,
            updated_at = NOW()
        WHERE ($2 IS NOT NULL AND $2 IS DISTINCT FROM m.condition_id)
           OR ($3 IS NOT NULL AND $3 IS DISTINCT FROM m.title)
           OR ($4 IS NOT NULL AND $4 IS DISTINCT FROM m.slug)
           OR ($5 IS NOT NULL AND $5 IS DISTINCT FROM m.outcomes)
           OR ($6 IS NOT NULL
               AND NOT ($20 = 'catalog' AND m.price_source = 'stream'
                        AND m.price_updated_at > NOW() - make_interval(secs => $21))
               AND $6 IS DISTINCT FROM m.outcome_prices)
           OR ($7 IS NOT NULL AND NOT (m.status = 'closed' AND $7 = 'active')
               AND $7 IS DISTINCT FROM m.status)
           OR ($8 IS NOT NULL AND ($20 = 'chain' OR m.resolution_status <> 'resolved')
               AND ($8 IS DISTINCT FROM m.resolution_status
                    OR $9 IS DISTINCT FROM m.winning_outcome))
           OR ($10 IS NOT NULL AND $10 IS DISTINCT FROM m.end_date)
           OR ($11 IS NOT NULL AND $11 IS DISTINCT FROM m.tradeable)
           OR ($12 IS NOT NULL AND $12 IS DISTINCT FROM m.accepting_orders)
           OR ($13 IS NOT NULL AND $13 IS DISTINCT FROM m.volume)
           OR ($14 IS NOT NULL AND $14 IS DISTINCT FROM m.volume_24h)
           OR ($15 IS NOT NULL AND $15 IS DISTINCT FROM m.liquidity)
           OR ($16 IS NOT NULL AND ($16 IS DISTINCT FROM m.event_id
                    OR $17 IS DISTINCT FROM m.event_title
                    OR $18 IS DISTINCT FROM m.event_volume))
           OR ($19 IS NOT NULL AND $19 IS DISTINCT FROM m.token_ids)
           OR ($22 IS NOT NULL AND (m.last_trade_at IS NULL OR $22 > m.last_trade_at))
        "#,
    )
    .bind(&patch.market_id)
    .bind(&patch.condition_id)
    .bind(&patch.title)
    .bind(&patch.slug)
    .bind(&patch.outcomes)
    .bind(&patch.outcome_prices)
    .bind(patch.status.map(|s| s.as_str()))
    .bind(patch.resolution_status.map(|s| s.as_str()))
    .bind(patch.winning_outcome)
    .bind(patch.end_date)
    .bind(patch.tradeable)
    .bind(patch.accepting_orders)
    .bind(patch.volume)
    .bind(patch.volume_24h)
    .bind(patch.liquidity)
    .bind(event_id)
    .bind(event_title)
    .bind(event_volume)
    .bind(&patch.token_ids)
    .bind(source.as_str())
    .bind(STREAM_PRICE_FRESH_SECS)
    .bind(patch.last_trade_at)
    .execute(pool)
    .await?;

    Ok(UpsertResult {
        changed: result.rows_affected() > 0,
    })
}

/// Get one record by its catalog id.
pub async fn get_market(pool: &PgPool, market_id: &str) -> anyhow::Result<Option<MarketRecord>> {
    let row = sqlx::query_as::<_, MarketRecord>(
        "SELECT * FROM market_records WHERE market_id = $1",
    )
    .bind(market_id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Get one record by its settlement-layer id.
pub async fn get_market_by_condition(
    pool: &PgPool,
    condition_id: &str,
) -> anyhow::Result<Option<MarketRecord>> {
    let row = sqlx::query_as::<_, MarketRecord>(
        "SELECT * FROM market_records WHERE condition_id = $1",
    )
    .bind(condition_id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Filtered read used by the browser/matcher consumers.
#[derive(Debug, Clone, Default)]
pub struct MarketFilter {
    pub resolution_status: Option<ResolutionStatus>,
    pub fresh_within_secs: Option<f64>,
    pub min_volume_24h: Option<Decimal>,
    pub limit: i64,
}

pub async fn list_markets(
    pool: &PgPool,
    filter: &MarketFilter,
) -> anyhow::Result<Vec<MarketRecord>> {
    let limit = if filter.limit > 0 { filter.limit } else { 100 };
    let rows = sqlx::query_as::<_, MarketRecord>(
        r#"
        SELECT * FROM market_records
        WHERE ($1::TEXT IS NULL OR resolution_status = $1)
          AND ($2::DOUBLE PRECISION IS NULL
               OR updated_at > NOW() - make_interval(secs => $2))
          AND ($3::NUMERIC IS NULL OR volume_24h >= $3)
        ORDER BY volume_24h DESC
        LIMIT $4
        "#,
    )
    .bind(filter.resolution_status.map(|s| s.as_str()))
    .bind(filter.fresh_within_secs)
    .bind(filter.min_volume_24h)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// The redemption view: markets whose payout is unambiguously known.
pub async fn get_resolved_markets(pool: &PgPool) -> anyhow::Result<Vec<MarketRecord>> {
    let rows = sqlx::query_as::<_, MarketRecord>(
        r#"
        SELECT * FROM market_records
        WHERE resolution_status = 'resolved' AND winning_outcome IS NOT NULL
        ORDER BY updated_at DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Markets the lifecycle sweep should look at: past their end date or
/// reported closed, and not yet resolved.
pub async fn get_lifecycle_candidates(
    pool: &PgPool,
    limit: i64,
) -> anyhow::Result<Vec<MarketRecord>> {
    let rows = sqlx::query_as::<_, MarketRecord>(
        r#"
        SELECT * FROM market_records
        WHERE resolution_status <> 'resolved'
          AND (status = 'closed' OR (end_date IS NOT NULL AND end_date < NOW()))
        ORDER BY volume_24h DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Scheduling inputs for the tiered fetch pass.
pub async fn get_scheduling_summaries(pool: &PgPool) -> anyhow::Result<Vec<MarketSummary>> {
    let rows = sqlx::query_as::<_, MarketSummary>(
        r#"
        SELECT market_id, volume_24h, end_date,
               (resolution_status = 'resolved') AS resolved
        FROM market_records
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Row feeding the streamer's subscription set.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub market_id: String,
    pub token_ids: Vec<String>,
    pub outcome_count: i64,
}

/// Markets whose tokens the streamer should hold subscriptions for:
/// watched ∪ traded within the activity window ∪ current top volume,
/// unresolved only.
pub async fn get_subscription_rows(
    pool: &PgPool,
    top_n: i64,
    active_window_secs: f64,
) -> anyhow::Result<Vec<SubscriptionRow>> {
    let rows = sqlx::query_as::<_, SubscriptionRow>(
        r#"
        SELECT market_id, token_ids, CARDINALITY(outcomes)::BIGINT AS outcome_count
        FROM market_records
        WHERE resolution_status <> 'resolved'
          AND CARDINALITY(token_ids) > 0
          AND (
              market_id IN (SELECT market_id FROM watched_markets
                            WHERE active_interest_count > 0)
              OR last_trade_at > NOW() - make_interval(secs => $1)
              OR market_id IN (SELECT market_id FROM market_records
                               WHERE resolution_status <> 'resolved'
                               ORDER BY volume_24h DESC LIMIT $2)
          )
        "#,
    )
    .bind(active_window_secs)
    .bind(top_n)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
