use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use polysync::models::MarketPatch;

/// Connect to the test database and run all migrations. Returns `None` when
/// `TEST_DATABASE_URL` is unset so the suite passes without a database.
#[allow(dead_code)]
pub async fn setup_test_db() -> Option<PgPool> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set — skipping database test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("Failed to connect to test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    // Clean tables for test isolation
    sqlx::query("DELETE FROM watched_markets").execute(&pool).await.ok();
    sqlx::query("DELETE FROM market_records").execute(&pool).await.ok();

    Some(pool)
}

/// A minimal active binary-market patch, ready to customize.
#[allow(dead_code)]
pub fn base_patch(market_id: &str) -> MarketPatch {
    use rust_decimal::Decimal;

    let mut patch = MarketPatch::new(market_id);
    patch.condition_id = Some(format!("0xcond_{market_id}"));
    patch.title = Some(format!("Test market {market_id}"));
    patch.outcomes = Some(vec!["Yes".into(), "No".into()]);
    patch.outcome_prices = Some(vec![Decimal::new(60, 2), Decimal::new(40, 2)]);
    patch.volume = Some(Decimal::from(10_000));
    patch.volume_24h = Some(Decimal::from(1_000));
    patch.token_ids = Some(vec![
        format!("tok_{market_id}_yes"),
        format!("tok_{market_id}_no"),
    ]);
    patch
}
