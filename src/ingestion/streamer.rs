use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep, sleep_until, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::db::market_repo::{self, StoreError};
use crate::models::{MarketPatch, Source};
use crate::polymarket::types::{
    best_bid_ask, parse_stream_messages, parse_stream_timestamp, StreamMessage, WsSubscribe,
};
use crate::retry::RetryPolicy;
use crate::services::subscriptions::TokenSubscription;

const PING_INTERVAL: Duration = Duration::from_secs(25);
/// Reconnect if nothing at all (including pings) arrives within this bound.
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const DEDUP_CAPACITY: usize = 1_000;

#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub ws_url: String,
    /// Messages older than this relative to processing time are dropped.
    pub stale_threshold_secs: i64,
}

/// Bounded recent-message fingerprint cache for duplicate suppression.
/// Remembers the last `capacity` `(token, timestamp, price)` fingerprints.
pub struct DedupCache {
    seen: HashSet<u64>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl DedupCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record a fingerprint; returns false if it was already present.
    pub fn insert(&mut self, token_id: &str, timestamp: &str, price: Decimal) -> bool {
        let mut hasher = DefaultHasher::new();
        token_id.hash(&mut hasher);
        timestamp.hash(&mut hasher);
        price.hash(&mut hasher);
        let fingerprint = hasher.finish();

        if !self.seen.insert(fingerprint) {
            return false;
        }
        self.order.push_back(fingerprint);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// Mid price from one token's own best bid and best ask. The two outcomes
/// of a market have independent books; averaging their quoted prices
/// against each other is not a market price.
pub fn mid_price(best_bid: Decimal, best_ask: Decimal) -> Decimal {
    (best_bid + best_ask) / Decimal::TWO
}

/// One applicable price observation pulled out of a stream message.
#[derive(Debug, Clone)]
pub struct PriceUpdate {
    pub token_id: String,
    pub price: Decimal,
    pub timestamp: Option<String>,
    pub is_trade: bool,
}

/// Flatten a stream message into price observations. Unknown message
/// shapes yield nothing; price-change entries missing either side of the
/// book are not a usable quote.
pub fn extract_updates(message: &StreamMessage) -> Vec<PriceUpdate> {
    match message {
        StreamMessage::Book {
            asset_id,
            timestamp,
            bids,
            asks,
            ..
        } => match best_bid_ask(bids, asks) {
            Some((bid, ask)) => vec![PriceUpdate {
                token_id: asset_id.clone(),
                price: mid_price(bid, ask),
                timestamp: timestamp.clone(),
                is_trade: false,
            }],
            None => Vec::new(),
        },
        StreamMessage::PriceChange {
            timestamp,
            price_changes,
            ..
        } => price_changes
            .iter()
            .filter_map(|change| {
                let bid = change.best_bid.as_deref().and_then(|s| Decimal::from_str(s).ok())?;
                let ask = change.best_ask.as_deref().and_then(|s| Decimal::from_str(s).ok())?;
                Some(PriceUpdate {
                    token_id: change.asset_id.clone(),
                    price: mid_price(bid, ask),
                    timestamp: timestamp.clone(),
                    is_trade: false,
                })
            })
            .collect(),
        StreamMessage::LastTradePrice {
            asset_id,
            timestamp,
            price,
            ..
        } => match price.as_deref().and_then(|s| Decimal::from_str(s).ok()) {
            Some(price) => vec![PriceUpdate {
                token_id: asset_id.clone(),
                price,
                timestamp: timestamp.clone(),
                is_trade: true,
            }],
            None => Vec::new(),
        },
        StreamMessage::Unknown => Vec::new(),
    }
}

/// A message timestamp older than the staleness threshold is rejected.
/// Messages without a parseable timestamp are taken at face value.
pub fn is_stale(timestamp: Option<&str>, now: DateTime<Utc>, threshold_secs: i64) -> bool {
    let Some(ts) = timestamp.and_then(parse_stream_timestamp) else {
        return false;
    };
    (now - ts).num_seconds() > threshold_secs
}

/// Build the store patch for one update. Only book-derived mids become
/// stored prices: a trade print is a single fill, not a quote, so it
/// advances `last_trade_at` and nothing else. Binary markets get the full
/// aligned price pair (complement = 1 − mid); markets with more outcomes
/// never get stream prices, since one leg's book cannot reconstruct the
/// whole array.
pub fn build_price_patch(
    sub: &TokenSubscription,
    update: &PriceUpdate,
    now: DateTime<Utc>,
) -> Option<MarketPatch> {
    let mut patch = MarketPatch::new(sub.market_id.clone());

    if update.is_trade {
        let trade_at = update
            .timestamp
            .as_deref()
            .and_then(parse_stream_timestamp)
            .unwrap_or(now);
        patch.last_trade_at = Some(trade_at);
        return Some(patch);
    }

    if sub.outcome_count != 2 {
        return None;
    }

    let price = update.price.clamp(Decimal::ZERO, Decimal::ONE);
    let mut prices = vec![Decimal::ZERO; 2];
    prices[sub.outcome_index.min(1)] = price;
    prices[1 - sub.outcome_index.min(1)] = Decimal::ONE - price;
    patch.outcome_prices = Some(prices);
    Some(patch)
}

/// Run the price-stream loop: one long-lived connection, a ping timer, an
/// idle timeout, incremental subscription diffs from the refresher, and
/// jittered capped backoff on reconnect. A reconnect resubscribes the full
/// current set from scratch.
pub async fn run_price_streamer(
    cfg: StreamerConfig,
    pool: PgPool,
    sub_rx: watch::Receiver<Vec<TokenSubscription>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let policy = RetryPolicy::default();
    let mut attempt: u32 = 0;
    let mut sub_rx = sub_rx;
    let mut dedup = DedupCache::new(DEDUP_CAPACITY);

    loop {
        if *shutdown.borrow() {
            tracing::info!("Price streamer stopping");
            return;
        }

        tracing::info!(url = %cfg.ws_url, "Connecting to price stream...");
        match connect_async(&cfg.ws_url).await {
            Ok((ws_stream, _response)) => {
                tracing::info!("Price stream connected");
                gauge!("stream_connected").set(1.0);
                attempt = 0;

                let (mut write, mut read) = ws_stream.split();

                // Full resubscribe on every (re)connect; the incremental
                // diff below only applies to a live connection.
                let mut current: HashMap<String, TokenSubscription> = sub_rx
                    .borrow()
                    .iter()
                    .map(|s| (s.token_id.clone(), s.clone()))
                    .collect();
                if !current.is_empty() {
                    let msg = WsSubscribe::subscribe(current.keys().cloned().collect());
                    if let Ok(text) = serde_json::to_string(&msg) {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            tracing::error!(error = %e, "Failed to send initial subscribe");
                        }
                    }
                }
                tracing::info!(token_count = current.len(), "Subscribed to token set");

                let mut ping_timer = interval(PING_INTERVAL);
                ping_timer.tick().await; // consume the first immediate tick
                let mut last_message = Instant::now();

                loop {
                    tokio::select! {
                        msg = read.next() => {
                            last_message = Instant::now();
                            match msg {
                                Some(Ok(Message::Text(text))) => {
                                    handle_text_message(
                                        text.as_ref(),
                                        &pool,
                                        &current,
                                        &mut dedup,
                                        cfg.stale_threshold_secs,
                                    )
                                    .await;
                                }
                                Some(Ok(Message::Ping(data))) => {
                                    if let Err(e) = write.send(Message::Pong(data)).await {
                                        tracing::warn!(error = %e, "Failed to send pong");
                                        break;
                                    }
                                }
                                Some(Ok(Message::Close(_))) => {
                                    tracing::warn!("Stream server sent close frame");
                                    break;
                                }
                                Some(Ok(_)) => {} // Binary, Pong, Frame — ignore
                                Some(Err(e)) => {
                                    tracing::error!(error = %e, "Stream read error");
                                    break;
                                }
                                None => {
                                    tracing::warn!("Stream ended");
                                    break;
                                }
                            }
                        }
                        _ = ping_timer.tick() => {
                            if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                                tracing::warn!(error = %e, "Failed to send ping");
                                break;
                            }
                        }
                        _ = sleep_until(last_message + IDLE_TIMEOUT) => {
                            tracing::warn!(
                                idle_secs = IDLE_TIMEOUT.as_secs(),
                                "No stream traffic within idle bound — forcing reconnect"
                            );
                            break;
                        }
                        result = sub_rx.changed() => {
                            if result.is_err() {
                                tracing::warn!("Subscription channel closed");
                                break;
                            }
                            let desired: HashMap<String, TokenSubscription> = sub_rx
                                .borrow()
                                .iter()
                                .map(|s| (s.token_id.clone(), s.clone()))
                                .collect();
                            if let Err(e) = apply_subscription_diff(
                                &mut write,
                                &mut current,
                                desired,
                            )
                            .await
                            {
                                tracing::error!(error = %e, "Failed to apply subscription diff");
                                break;
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                tracing::info!("Price streamer stopping — closing connection");
                                let _ = write.send(Message::Close(None)).await;
                                gauge!("stream_connected").set(0.0);
                                return;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Stream connection failed");
            }
        }

        gauge!("stream_connected").set(0.0);
        counter!("stream_reconnects_total").increment(1);
        let delay = policy.jittered_delay_for(attempt);
        attempt = attempt.saturating_add(1);
        tracing::info!(delay_secs = delay.as_secs(), attempt, "Reconnecting stream...");
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// Send the incremental subscribe/unsubscribe pair for a changed set. The
/// connection stays up; only the delta goes over the wire.
async fn apply_subscription_diff<S>(
    write: &mut S,
    current: &mut HashMap<String, TokenSubscription>,
    desired: HashMap<String, TokenSubscription>,
) -> Result<(), S::Error>
where
    S: SinkExt<Message> + Unpin,
{
    let added: Vec<String> = desired
        .keys()
        .filter(|k| !current.contains_key(*k))
        .cloned()
        .collect();
    let removed: Vec<String> = current
        .keys()
        .filter(|k| !desired.contains_key(*k))
        .cloned()
        .collect();

    if !added.is_empty() {
        if let Ok(text) = serde_json::to_string(&WsSubscribe::subscribe(added.clone())) {
            write.send(Message::Text(text)).await?;
        }
    }
    if !removed.is_empty() {
        if let Ok(text) = serde_json::to_string(&WsSubscribe::unsubscribe(removed.clone())) {
            write.send(Message::Text(text)).await?;
        }
    }

    if !added.is_empty() || !removed.is_empty() {
        tracing::info!(
            added = added.len(),
            removed = removed.len(),
            total = desired.len(),
            "Applied subscription diff"
        );
    }
    *current = desired;
    Ok(())
}

async fn handle_text_message(
    text: &str,
    pool: &PgPool,
    subscriptions: &HashMap<String, TokenSubscription>,
    dedup: &mut DedupCache,
    stale_threshold_secs: i64,
) {
    for message in parse_stream_messages(text) {
        counter!("stream_messages_total").increment(1);

        for update in extract_updates(&message) {
            let now = Utc::now();
            let ts_key = update.timestamp.as_deref().unwrap_or("");

            if !dedup.insert(&update.token_id, ts_key, update.price) {
                counter!("stream_duplicates_total").increment(1);
                continue;
            }
            if is_stale(update.timestamp.as_deref(), now, stale_threshold_secs) {
                counter!("stream_stale_total").increment(1);
                continue;
            }

            let Some(sub) = subscriptions.get(&update.token_id) else {
                // Late message for a token we just unsubscribed.
                continue;
            };
            let Some(patch) = build_price_patch(sub, &update, now) else {
                continue;
            };

            match market_repo::upsert(pool, &patch, Source::Stream).await {
                Ok(result) => {
                    if result.changed {
                        counter!("stream_updates_applied_total").increment(1);
                    }
                }
                Err(StoreError::InvariantViolation(msg)) => {
                    counter!("invariant_violations_total").increment(1);
                    tracing::error!(
                        market_id = %sub.market_id,
                        %msg,
                        "Stream price rejected by store invariants"
                    );
                }
                Err(e) => {
                    tracing::warn!(error = %e, market_id = %sub.market_id, "Stream upsert failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn sub(token: &str, index: usize, count: usize) -> TokenSubscription {
        TokenSubscription {
            token_id: token.into(),
            market_id: "m1".into(),
            outcome_index: index,
            outcome_count: count,
        }
    }

    #[test]
    fn test_mid_price_from_own_book() {
        assert_eq!(mid_price(dec("0.48"), dec("0.52")), dec("0.50"));
        assert_eq!(mid_price(dec("0.10"), dec("0.20")), dec("0.15"));
    }

    #[test]
    fn test_dedup_suppresses_repeat_fingerprint() {
        let mut cache = DedupCache::new(10);
        assert!(cache.insert("tok", "1700000000123", dec("0.5")));
        assert!(!cache.insert("tok", "1700000000123", dec("0.5")));
        // Any component differing is a new observation.
        assert!(cache.insert("tok", "1700000000124", dec("0.5")));
        assert!(cache.insert("tok", "1700000000124", dec("0.51")));
    }

    #[test]
    fn test_dedup_evicts_oldest_at_capacity() {
        let mut cache = DedupCache::new(2);
        assert!(cache.insert("a", "1", dec("0.5")));
        assert!(cache.insert("b", "1", dec("0.5")));
        assert!(cache.insert("c", "1", dec("0.5"))); // evicts a
        assert!(cache.insert("a", "1", dec("0.5")));
    }

    #[test]
    fn test_staleness_threshold() {
        let now = Utc::now();
        let fresh = (now - chrono::Duration::seconds(10)).timestamp_millis().to_string();
        let stale = (now - chrono::Duration::seconds(120)).timestamp_millis().to_string();
        assert!(!is_stale(Some(&fresh), now, 60));
        assert!(is_stale(Some(&stale), now, 60));
        // Unparseable or missing timestamps are not grounds for rejection.
        assert!(!is_stale(Some("garbage"), now, 60));
        assert!(!is_stale(None, now, 60));
    }

    #[test]
    fn test_binary_patch_carries_complement() {
        let update = PriceUpdate {
            token_id: "tok-no".into(),
            price: dec("0.30"),
            timestamp: None,
            is_trade: false,
        };
        let patch = build_price_patch(&sub("tok-no", 1, 2), &update, Utc::now()).unwrap();
        assert_eq!(patch.outcome_prices, Some(vec![dec("0.70"), dec("0.30")]));
    }

    #[test]
    fn test_non_binary_book_update_skipped() {
        let update = PriceUpdate {
            token_id: "tok".into(),
            price: dec("0.30"),
            timestamp: None,
            is_trade: false,
        };
        assert!(build_price_patch(&sub("tok", 0, 3), &update, Utc::now()).is_none());
    }

    #[test]
    fn test_trade_update_advances_last_trade_at() {
        let update = PriceUpdate {
            token_id: "tok".into(),
            price: dec("0.30"),
            timestamp: Some("1700000000".into()),
            is_trade: true,
        };
        let patch = build_price_patch(&sub("tok", 0, 3), &update, Utc::now()).unwrap();
        assert!(patch.last_trade_at.is_some());
        assert!(patch.outcome_prices.is_none());
    }

    #[test]
    fn test_trade_print_never_becomes_a_stored_price() {
        // Even on a binary market the stored price comes from the book mid,
        // never from a single fill.
        let update = PriceUpdate {
            token_id: "tok-yes".into(),
            price: dec("0.55"),
            timestamp: Some("1700000000123".into()),
            is_trade: true,
        };
        let patch = build_price_patch(&sub("tok-yes", 0, 2), &update, Utc::now()).unwrap();
        assert!(patch.outcome_prices.is_none());
        assert!(patch.last_trade_at.is_some());
    }

    #[test]
    fn test_extract_from_price_change_needs_both_sides() {
        let raw = r#"{
            "event_type": "price_change",
            "market": "0xabc",
            "timestamp": "1700000000123",
            "price_changes": [
                {"asset_id": "tok-a", "best_bid": "0.40", "best_ask": "0.44"},
                {"asset_id": "tok-b", "best_bid": "0.55"}
            ]
        }"#;
        let messages = parse_stream_messages(raw);
        let updates = extract_updates(&messages[0]);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].token_id, "tok-a");
        assert_eq!(updates[0].price, dec("0.42"));
    }
}
