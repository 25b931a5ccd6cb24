use sqlx::PgPool;

use crate::models::WatchedMarket;

/// Register external interest in a market (an open position referencing
/// it). Insert-or-increment; the first registration creates the row.
pub async fn register_interest(pool: &PgPool, market_id: &str) -> anyhow::Result<WatchedMarket> {
    let row = sqlx::query_as::<_, WatchedMarket>(
        r#"
        INSERT INTO watched_markets (market_id, active_interest_count, last_interest_at)
        VALUES ($1, 1, NOW())
        ON CONFLICT (market_id) DO UPDATE
        SET active_interest_count = watched_markets.active_interest_count + 1,
            last_interest_at = NOW(),
            updated_at = NOW()
        RETURNING *
        "#,
    )
    .bind(market_id)
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Release one unit of interest. The count never goes below zero.
pub async fn release_interest(
    pool: &PgPool,
    market_id: &str,
) -> anyhow::Result<Option<WatchedMarket>> {
    let row = sqlx::query_as::<_, WatchedMarket>(
        r#"
        UPDATE watched_markets
        SET active_interest_count = GREATEST(active_interest_count - 1, 0),
            updated_at = NOW()
        WHERE market_id = $1
        RETURNING *
        "#,
    )
    .bind(market_id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Zero out interest that has not been refreshed within the TTL. Returns
/// the number of expired rows.
pub async fn expire_interest(pool: &PgPool, ttl_secs: f64) -> anyhow::Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE watched_markets
        SET active_interest_count = 0, updated_at = NOW()
        WHERE active_interest_count > 0
          AND last_interest_at < NOW() - make_interval(secs => $1)
        "#,
    )
    .bind(ttl_secs)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// All markets with live interest.
pub async fn list_watched(pool: &PgPool) -> anyhow::Result<Vec<WatchedMarket>> {
    let rows = sqlx::query_as::<_, WatchedMarket>(
        "SELECT * FROM watched_markets WHERE active_interest_count > 0 ORDER BY market_id",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Tier-0 input: watched, unresolved market ids. LEFT JOIN so a watched
/// market the catalog has never sighted still gets polled (the fetch will
/// create its record).
pub async fn watched_unresolved_ids(pool: &PgPool) -> anyhow::Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT w.market_id
        FROM watched_markets w
        LEFT JOIN market_records m USING (market_id)
        WHERE w.active_interest_count > 0
          AND (m.resolution_status IS NULL OR m.resolution_status <> 'resolved')
        ORDER BY w.market_id
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.0).collect())
}
