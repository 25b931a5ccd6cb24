use sqlx::PgPool;
use tokio::sync::watch;
use tokio::time::{interval, Duration};

use crate::db::market_repo::{self, SubscriptionRow};

/// One token the streamer should hold a subscription for, with enough
/// context to write its price back into the right slot of the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSubscription {
    pub token_id: String,
    pub market_id: String,
    pub outcome_index: usize,
    pub outcome_count: usize,
}

/// Expand subscription rows into per-token entries. Token ids are aligned
/// positionally with outcomes; rows whose arity disagrees are skipped.
pub fn build_token_subscriptions(rows: &[SubscriptionRow]) -> Vec<TokenSubscription> {
    let mut subs = Vec::new();
    for row in rows {
        let count = row.outcome_count.max(0) as usize;
        if count != 0 && row.token_ids.len() != count {
            tracing::debug!(
                market_id = %row.market_id,
                tokens = row.token_ids.len(),
                outcomes = count,
                "Skipping market with misaligned token list"
            );
            continue;
        }
        for (idx, token_id) in row.token_ids.iter().enumerate() {
            if token_id.is_empty() {
                continue;
            }
            subs.push(TokenSubscription {
                token_id: token_id.clone(),
                market_id: row.market_id.clone(),
                outcome_index: idx,
                outcome_count: row.token_ids.len(),
            });
        }
    }
    subs
}

/// Periodically recompute the streamer's subscription set (watched ∪
/// recently traded ∪ top volume) and broadcast it over a `watch` channel.
/// The streamer applies the difference to its live connection; this task
/// never touches the connection itself.
pub async fn run_subscription_refresher(
    pool: PgPool,
    tx: watch::Sender<Vec<TokenSubscription>>,
    refresh_secs: u64,
    top_volume_count: i64,
    active_window_secs: f64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_secs(refresh_secs));

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("Subscription refresher stopping");
                    return;
                }
                continue;
            }
        }

        let rows = match market_repo::get_subscription_rows(
            &pool,
            top_volume_count,
            active_window_secs,
        )
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load subscription rows");
                continue;
            }
        };

        let subs = build_token_subscriptions(&rows);
        metrics::gauge!("stream_subscription_tokens").set(subs.len() as f64);
        tracing::debug!(
            markets = rows.len(),
            tokens = subs.len(),
            "Recomputed subscription set"
        );

        if tx.send(subs).is_err() {
            tracing::warn!("Subscription channel closed — refresher exiting");
            return;
        }
    }
}
