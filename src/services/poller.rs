use chrono::{Duration as ChronoDuration, Utc};
use futures_util::stream::{self, StreamExt};
use metrics::{counter, histogram};
use sqlx::PgPool;
use std::collections::HashSet;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};

use crate::db::market_repo::{self, StoreError};
use crate::db::watch_repo;
use crate::models::{MarketPatch, MarketRecord, Source};
use crate::polymarket::types::GammaMarket;
use crate::polymarket::GammaClient;
use crate::retry::RetryPolicy;
use crate::services::resolution::{self, LifecycleInput};
use crate::services::scheduler::{self, SchedulerConfig};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval_secs: u64,
    /// Page cap for the grouped volume-ordered fetch.
    pub event_pages: u32,
    pub page_size: u32,
    /// Ids per bulk fetch call.
    pub batch_size: usize,
    /// Concurrent bulk fetches within a pass.
    pub fetch_concurrency: usize,
    /// Cap on lifecycle candidates examined per cycle.
    pub lifecycle_limit: i64,
    /// Grace window after expiry before outcome extraction is attempted.
    pub grace_window_secs: i64,
    /// Watch interest not refreshed within this TTL is zeroed out.
    pub watch_ttl_secs: f64,
    pub scheduler: SchedulerConfig,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            event_pages: 3,
            page_size: 100,
            batch_size: 50,
            fetch_concurrency: 4,
            lifecycle_limit: 500,
            grace_window_secs: 3600,
            watch_ttl_secs: 86_400.0,
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// Run the catalog poll loop. One cycle = grouped fetch (Pass A), tiered
/// standalone fetch (Pass B), lifecycle sweep (Pass C). Cycles are
/// serialized against themselves: a cycle that overruns its period causes
/// the overlapped ticks to be skipped and counted, never run concurrently.
pub async fn run_catalog_poller(
    gamma: GammaClient,
    pool: PgPool,
    cfg: PollerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_secs(cfg.interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let pacing = RetryPolicy::default();
    let mut consecutive_transient: u32 = 0;
    let mut cycle: u64 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("Catalog poller stopping");
                    return;
                }
                continue;
            }
        }

        let started = Instant::now();
        let mut transient = false;

        // Cycle hygiene: drop watch interest that was never released.
        match watch_repo::expire_interest(&pool, cfg.watch_ttl_secs).await {
            Ok(expired) if expired > 0 => {
                tracing::info!(expired, "Expired stale watch interest");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to expire watch interest"),
        }

        let pass_a_start = Instant::now();
        let touched = run_pass_a(&gamma, &pool, &cfg, &mut transient).await;
        histogram!("poll_pass_seconds", "pass" => "a")
            .record(pass_a_start.elapsed().as_secs_f64());

        let pass_b_start = Instant::now();
        run_pass_b(&gamma, &pool, &cfg, cycle, &touched, &mut transient).await;
        histogram!("poll_pass_seconds", "pass" => "b")
            .record(pass_b_start.elapsed().as_secs_f64());

        let pass_c_start = Instant::now();
        run_pass_c(&gamma, &pool, &cfg, &mut transient).await;
        histogram!("poll_pass_seconds", "pass" => "c")
            .record(pass_c_start.elapsed().as_secs_f64());

        cycle += 1;
        counter!("poll_cycles_total").increment(1);

        let elapsed = started.elapsed();
        if elapsed > Duration::from_secs(cfg.interval_secs) {
            let skipped = elapsed.as_secs() / cfg.interval_secs;
            counter!("poll_cycles_skipped_total").increment(skipped);
            tracing::warn!(
                cycle,
                elapsed_secs = elapsed.as_secs(),
                skipped,
                "Poll cycle overran its period; overlapped ticks skipped"
            );
        }

        // Transient upstream trouble (429/5xx/timeouts) slows the NEXT
        // cycle down instead of retrying inside this one.
        if transient {
            consecutive_transient = consecutive_transient.saturating_add(1);
            let pause = pacing.delay_for(consecutive_transient - 1);
            tracing::warn!(
                consecutive = consecutive_transient,
                pause_secs = pause.as_secs(),
                "Transient upstream errors — backing off next cycle"
            );
            sleep(pause).await;
        } else {
            consecutive_transient = 0;
        }
    }
}

/// Pass A: paginated grouped fetch, ordered by descending volume so the
/// highest-impact markets are enriched within the first few pages
/// regardless of age. Populates `event_group` from the parent.
async fn run_pass_a(
    gamma: &GammaClient,
    pool: &PgPool,
    cfg: &PollerConfig,
    transient: &mut bool,
) -> HashSet<String> {
    let mut touched = HashSet::new();
    let mut upserted: u64 = 0;

    for page in 0..cfg.event_pages {
        let offset = page * cfg.page_size;
        let events = match gamma.list_events(cfg.page_size, offset).await {
            Ok(events) => events,
            Err(e) => {
                counter!("catalog_fetch_errors_total", "pass" => "a").increment(1);
                if e.is_transient() {
                    *transient = true;
                }
                tracing::warn!(error = %e, page, "Grouped fetch failed — pass continues with earlier pages");
                break;
            }
        };
        let page_len = events.len();

        for event in &events {
            // An event wrapper without an id carries no association worth
            // writing; its markets still get their standalone fields.
            let group = (!event.id.is_empty()).then(|| event.as_event_group());
            for market in &event.markets {
                if apply_market(pool, market, group.clone(), "a").await {
                    upserted += 1;
                }
                touched.insert(market.id.clone());
            }
        }

        if page_len < cfg.page_size as usize {
            break;
        }
    }

    counter!("poll_markets_total", "pass" => "a").increment(upserted);
    tracing::debug!(markets = touched.len(), upserted, "Pass A complete");
    touched
}

/// Pass B: tier-planned bulk fetches with bounded concurrency.
async fn run_pass_b(
    gamma: &GammaClient,
    pool: &PgPool,
    cfg: &PollerConfig,
    cycle: u64,
    touched_in_pass_a: &HashSet<String>,
    transient: &mut bool,
) {
    let watched = match watch_repo::watched_unresolved_ids(pool).await {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load watch list — tier 0 empty this cycle");
            Vec::new()
        }
    };
    let summaries = match market_repo::get_scheduling_summaries(pool).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load scheduling summaries");
            Vec::new()
        }
    };

    let plan = scheduler::build_fetch_plan(
        cycle,
        &watched,
        &summaries,
        touched_in_pass_a,
        Utc::now(),
        &cfg.scheduler,
    );
    tracing::debug!(
        watched = plan.watched.len(),
        expiring = plan.expiring.len(),
        high = plan.high_volume.len(),
        mid = plan.mid_volume.len(),
        tail = plan.long_tail.len(),
        "Pass B fetch plan"
    );

    let chunks: Vec<Vec<String>> = plan
        .all_ids()
        .chunks(cfg.batch_size.max(1))
        .map(|c| c.to_vec())
        .collect();

    let results: Vec<Result<Vec<GammaMarket>, _>> = stream::iter(chunks)
        .map(|chunk| {
            let gamma = gamma.clone();
            async move { gamma.get_markets_by_ids(&chunk).await }
        })
        .buffer_unordered(cfg.fetch_concurrency.max(1))
        .collect()
        .await;

    let mut upserted: u64 = 0;
    for result in results {
        match result {
            Ok(markets) => {
                for market in &markets {
                    if apply_market(pool, market, None, "b").await {
                        upserted += 1;
                    }
                }
            }
            Err(e) => {
                counter!("catalog_fetch_errors_total", "pass" => "b").increment(1);
                if e.is_transient() {
                    *transient = true;
                }
                tracing::warn!(error = %e, "Bulk fetch failed — batch skipped");
            }
        }
    }

    counter!("poll_markets_total", "pass" => "b").increment(upserted);
}

/// Pass C: lifecycle sweep over markets past their end date or reported
/// closed. Re-fetches the candidates in bulk and writes the classified
/// `(status, resolution_status, winning_outcome)` triple.
async fn run_pass_c(
    gamma: &GammaClient,
    pool: &PgPool,
    cfg: &PollerConfig,
    transient: &mut bool,
) {
    let candidates = match market_repo::get_lifecycle_candidates(pool, cfg.lifecycle_limit).await {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load lifecycle candidates");
            return;
        }
    };
    if candidates.is_empty() {
        return;
    }

    let grace = ChronoDuration::seconds(cfg.grace_window_secs);
    let now = Utc::now();
    let mut resolved: u64 = 0;
    let mut examined: u64 = 0;

    for chunk in candidates.chunks(cfg.batch_size.max(1)) {
        let ids: Vec<String> = chunk.iter().map(|c| c.market_id.clone()).collect();
        let fetched = match gamma.get_markets_by_ids(&ids).await {
            Ok(markets) => markets,
            Err(e) => {
                counter!("catalog_fetch_errors_total", "pass" => "c").increment(1);
                if e.is_transient() {
                    *transient = true;
                }
                tracing::warn!(error = %e, "Lifecycle fetch failed — batch retried next sweep");
                continue;
            }
        };

        for stored in chunk {
            let payload = fetched.iter().find(|m| m.id == stored.market_id);
            let verdict = classify_candidate(stored, payload, now, grace);
            examined += 1;

            let mut patch = MarketPatch::new(stored.market_id.clone());
            patch.status = Some(verdict.status);
            patch.resolution_status = Some(verdict.resolution_status);
            patch.winning_outcome = verdict.winning_outcome.map(|i| i as i32);

            match market_repo::upsert(pool, &patch, Source::Catalog).await {
                Ok(result) => {
                    if result.changed
                        && verdict.resolution_status
                            == crate::models::ResolutionStatus::Resolved
                    {
                        resolved += 1;
                        tracing::info!(
                            market_id = %stored.market_id,
                            winning_outcome = ?verdict.winning_outcome,
                            "Market resolved"
                        );
                    }
                }
                Err(StoreError::InvariantViolation(msg)) => {
                    counter!("invariant_violations_total").increment(1);
                    tracing::error!(
                        market_id = %stored.market_id,
                        %msg,
                        "Lifecycle verdict rejected by store invariants"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, market_id = %stored.market_id, "Lifecycle upsert failed");
                }
            }
        }
    }

    counter!("poll_markets_total", "pass" => "c").increment(examined);
    counter!("lifecycle_resolved_total").increment(resolved);
}

/// Merge the stored record with the latest payload (when the re-fetch
/// returned one) and classify. The payload wins for every field it carries.
fn classify_candidate(
    stored: &MarketRecord,
    payload: Option<&GammaMarket>,
    now: chrono::DateTime<Utc>,
    grace: ChronoDuration,
) -> resolution::LifecycleVerdict {
    let payload_outcomes = payload.map(|p| p.parse_outcomes()).unwrap_or_default();
    let payload_prices = payload.and_then(|p| p.parse_outcome_prices());

    let outcomes: &[String] = if payload_outcomes.is_empty() {
        &stored.outcomes
    } else {
        &payload_outcomes
    };
    let prices: &[rust_decimal::Decimal] = match &payload_prices {
        Some(p) => p,
        None => &stored.outcome_prices,
    };

    let closed = payload
        .and_then(|p| p.closed)
        .unwrap_or(stored.status == "closed");
    let end_date = payload.and_then(|p| p.parse_end_date()).or(stored.end_date);
    let explicit = payload.and_then(|p| p.resolved_outcome.as_deref());

    resolution::classify(
        &LifecycleInput {
            closed,
            end_date,
            outcomes,
            outcome_prices: prices,
            explicit_outcome: explicit,
        },
        now,
        grace,
    )
}

/// Upsert one catalog market. Returns true when the record changed. The
/// only reason a fetched market is dropped is an empty/absent/placeholder
/// price array; a malformed or invariant-breaking record is logged and
/// skipped without aborting the batch.
async fn apply_market(
    pool: &PgPool,
    market: &GammaMarket,
    event_group: Option<crate::models::EventGroup>,
    pass: &'static str,
) -> bool {
    let Some(patch) = market.into_patch(event_group.as_ref()) else {
        counter!("catalog_markets_dropped_total", "pass" => pass).increment(1);
        return false;
    };

    match market_repo::upsert(pool, &patch, Source::Catalog).await {
        Ok(result) => result.changed,
        Err(StoreError::InvariantViolation(msg)) => {
            counter!("invariant_violations_total").increment(1);
            tracing::error!(market_id = %market.id, %msg, "Catalog record rejected by store invariants");
            false
        }
        Err(e) => {
            tracing::warn!(error = %e, market_id = %market.id, "Catalog upsert failed");
            false
        }
    }
}
