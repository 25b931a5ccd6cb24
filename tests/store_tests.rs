mod common;

use rust_decimal::Decimal;

use polysync::db::{market_repo, watch_repo};
use polysync::ingestion::settlement::{apply_settlement, SettlementError};
use polysync::models::{
    EventGroup, MarketPatch, MarketStatus, ResolutionStatus, SettlementEvent, Source,
};

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_upsert_is_idempotent_and_updated_at_only_moves_on_change() {
    let Some(pool) = common::setup_test_db().await else { return };

    let patch = common::base_patch("m_idem");
    let first = market_repo::upsert(&pool, &patch, Source::Catalog).await.unwrap();
    assert!(first.changed);

    let created = market_repo::get_market(&pool, "m_idem").await.unwrap().unwrap();

    // Identical patch: no-op, updated_at untouched.
    let second = market_repo::upsert(&pool, &patch, Source::Catalog).await.unwrap();
    assert!(!second.changed);
    let unchanged = market_repo::get_market(&pool, "m_idem").await.unwrap().unwrap();
    assert_eq!(unchanged.updated_at, created.updated_at);

    // A real change bumps it.
    let mut moved = patch.clone();
    moved.outcome_prices = Some(vec![dec("0.70"), dec("0.30")]);
    let third = market_repo::upsert(&pool, &moved, Source::Catalog).await.unwrap();
    assert!(third.changed);
    let bumped = market_repo::get_market(&pool, "m_idem").await.unwrap().unwrap();
    assert!(bumped.updated_at > created.updated_at);
    assert_eq!(bumped.outcome_prices, vec![dec("0.70"), dec("0.30")]);
}

#[tokio::test]
async fn test_catalog_cannot_revert_resolved_record() {
    let Some(pool) = common::setup_test_db().await else { return };

    market_repo::upsert(&pool, &common::base_patch("m_res"), Source::Catalog)
        .await
        .unwrap();

    // Chain settles the market.
    let event = SettlementEvent {
        condition_id: "0xcond_m_res".into(),
        winning_outcome_label: Some("Yes".into()),
        winning_outcome_index: None,
    };
    apply_settlement(&pool, &event).await.unwrap();

    let resolved = market_repo::get_market(&pool, "m_res").await.unwrap().unwrap();
    assert_eq!(resolved.resolution_status, "resolved");
    assert_eq!(resolved.winning_outcome, Some(0));
    assert_eq!(resolved.status, "closed");

    // A later catalog fetch claiming the market is still open changes nothing
    // about resolution or status.
    let mut stale = common::base_patch("m_res");
    stale.status = Some(MarketStatus::Active);
    stale.resolution_status = Some(ResolutionStatus::Pending);
    market_repo::upsert(&pool, &stale, Source::Catalog).await.unwrap();

    let after = market_repo::get_market(&pool, "m_res").await.unwrap().unwrap();
    assert_eq!(after.resolution_status, "resolved");
    assert_eq!(after.winning_outcome, Some(0));
    assert_eq!(after.status, "closed");
}

#[tokio::test]
async fn test_settlement_disagreement_is_rejected() {
    let Some(pool) = common::setup_test_db().await else { return };

    market_repo::upsert(&pool, &common::base_patch("m_conflict"), Source::Catalog)
        .await
        .unwrap();

    let first = SettlementEvent {
        condition_id: "0xcond_m_conflict".into(),
        winning_outcome_label: None,
        winning_outcome_index: Some(0),
    };
    apply_settlement(&pool, &first).await.unwrap();

    let conflicting = SettlementEvent {
        condition_id: "0xcond_m_conflict".into(),
        winning_outcome_label: None,
        winning_outcome_index: Some(1),
    };
    let err = apply_settlement(&pool, &conflicting).await.unwrap_err();
    assert!(matches!(err, SettlementError::Disagreement { .. }));

    // The stored winner is untouched.
    let record = market_repo::get_market(&pool, "m_conflict").await.unwrap().unwrap();
    assert_eq!(record.winning_outcome, Some(0));
}

#[tokio::test]
async fn test_settlement_for_unknown_condition_creates_provisional_record() {
    let Some(pool) = common::setup_test_db().await else { return };

    let event = SettlementEvent {
        condition_id: "0xnever_seen".into(),
        winning_outcome_label: Some("Yes".into()),
        winning_outcome_index: None,
    };
    let applied = apply_settlement(&pool, &event).await.unwrap();
    assert!(applied.changed);

    let record = market_repo::get_market_by_condition(&pool, "0xnever_seen")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.market_id, "0xnever_seen");
    assert_eq!(record.resolution_status, "resolved");
    assert_eq!(record.winning_outcome, Some(0));
}

#[tokio::test]
async fn test_event_group_survives_event_less_fetch() {
    let Some(pool) = common::setup_test_db().await else { return };

    let mut grouped = common::base_patch("m_event");
    grouped.event_group = Some(EventGroup {
        event_id: "ev1".into(),
        event_title: Some("Election night".into()),
        event_volume: Some(dec("500000")),
    });
    market_repo::upsert(&pool, &grouped, Source::Catalog).await.unwrap();

    // Standalone fetch carries no event context.
    let mut standalone = common::base_patch("m_event");
    standalone.volume_24h = Some(dec("2000"));
    market_repo::upsert(&pool, &standalone, Source::Catalog).await.unwrap();

    let record = market_repo::get_market(&pool, "m_event").await.unwrap().unwrap();
    assert_eq!(record.event_id.as_deref(), Some("ev1"));
    assert_eq!(record.event_title.as_deref(), Some("Election night"));
}

#[tokio::test]
async fn test_fresh_stream_price_outranks_catalog_price() {
    let Some(pool) = common::setup_test_db().await else { return };

    market_repo::upsert(&pool, &common::base_patch("m_fresh"), Source::Catalog)
        .await
        .unwrap();

    let mut stream = MarketPatch::new("m_fresh");
    stream.outcome_prices = Some(vec![dec("0.55"), dec("0.45")]);
    market_repo::upsert(&pool, &stream, Source::Stream).await.unwrap();

    // Catalog price arriving inside the freshness window is ignored.
    let mut catalog = common::base_patch("m_fresh");
    catalog.outcome_prices = Some(vec![dec("0.10"), dec("0.90")]);
    market_repo::upsert(&pool, &catalog, Source::Catalog).await.unwrap();

    let record = market_repo::get_market(&pool, "m_fresh").await.unwrap().unwrap();
    assert_eq!(record.outcome_prices, vec![dec("0.55"), dec("0.45")]);
    assert_eq!(record.price_source.as_deref(), Some("stream"));

    // A newer stream price still goes through.
    let mut stream2 = MarketPatch::new("m_fresh");
    stream2.outcome_prices = Some(vec![dec("0.58"), dec("0.42")]);
    market_repo::upsert(&pool, &stream2, Source::Stream).await.unwrap();
    let record = market_repo::get_market(&pool, "m_fresh").await.unwrap().unwrap();
    assert_eq!(record.outcome_prices, vec![dec("0.58"), dec("0.42")]);
}

#[tokio::test]
async fn test_last_trade_at_only_moves_forward() {
    let Some(pool) = common::setup_test_db().await else { return };

    let now = chrono::Utc::now();
    let mut patch = common::base_patch("m_trade");
    patch.last_trade_at = Some(now);
    market_repo::upsert(&pool, &patch, Source::Stream).await.unwrap();

    // A replayed older trade cannot regress the timestamp.
    let mut older = MarketPatch::new("m_trade");
    older.last_trade_at = Some(now - chrono::Duration::hours(1));
    let result = market_repo::upsert(&pool, &older, Source::Stream).await.unwrap();
    assert!(!result.changed);

    let record = market_repo::get_market(&pool, "m_trade").await.unwrap().unwrap();
    let stored = record.last_trade_at.unwrap();
    assert!((stored - now).num_milliseconds().abs() < 5);
}

#[tokio::test]
async fn test_watch_interest_counts_and_release() {
    let Some(pool) = common::setup_test_db().await else { return };

    let w1 = watch_repo::register_interest(&pool, "m_watch").await.unwrap();
    assert_eq!(w1.active_interest_count, 1);
    let w2 = watch_repo::register_interest(&pool, "m_watch").await.unwrap();
    assert_eq!(w2.active_interest_count, 2);

    let released = watch_repo::release_interest(&pool, "m_watch").await.unwrap().unwrap();
    assert_eq!(released.active_interest_count, 1);

    // Never-catalogued watched markets still surface for scheduling.
    let ids = watch_repo::watched_unresolved_ids(&pool).await.unwrap();
    assert!(ids.contains(&"m_watch".to_string()));

    // Releasing past zero clamps.
    watch_repo::release_interest(&pool, "m_watch").await.unwrap();
    let drained = watch_repo::release_interest(&pool, "m_watch").await.unwrap().unwrap();
    assert_eq!(drained.active_interest_count, 0);

    let ids = watch_repo::watched_unresolved_ids(&pool).await.unwrap();
    assert!(!ids.contains(&"m_watch".to_string()));
}

#[tokio::test]
async fn test_redemption_view_requires_resolution_and_winner() {
    let Some(pool) = common::setup_test_db().await else { return };

    market_repo::upsert(&pool, &common::base_patch("m_open"), Source::Catalog)
        .await
        .unwrap();

    // Proposed but not yet resolved: not redemption-ready.
    let mut proposed = common::base_patch("m_proposed");
    proposed.status = Some(MarketStatus::Closed);
    proposed.resolution_status = Some(ResolutionStatus::Proposed);
    market_repo::upsert(&pool, &proposed, Source::Catalog).await.unwrap();

    let event = SettlementEvent {
        condition_id: "0xcond_m_done".into(),
        winning_outcome_label: Some("No".into()),
        winning_outcome_index: None,
    };
    market_repo::upsert(&pool, &common::base_patch("m_done"), Source::Catalog)
        .await
        .unwrap();
    apply_settlement(&pool, &event).await.unwrap();

    let redeemable = market_repo::get_resolved_markets(&pool).await.unwrap();
    let ids: Vec<&str> = redeemable.iter().map(|m| m.market_id.as_str()).collect();
    assert_eq!(ids, vec!["m_done"]);
    assert_eq!(redeemable[0].winning_outcome, Some(1));
}

#[tokio::test]
async fn test_invalid_patch_is_rejected_before_the_database() {
    let Some(pool) = common::setup_test_db().await else { return };

    // Winning outcome without a resolution status is a writer bug.
    let mut patch = common::base_patch("m_invalid");
    patch.winning_outcome = Some(0);
    let err = market_repo::upsert(&pool, &patch, Source::Catalog).await.unwrap_err();
    assert!(matches!(err, polysync::db::market_repo::StoreError::InvariantViolation(_)));
    assert!(market_repo::get_market(&pool, "m_invalid").await.unwrap().is_none());
}
