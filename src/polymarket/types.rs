use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

use crate::models::{EventGroup, MarketPatch, MarketStatus};

// ---------------------------------------------------------------------------
// Catalog (Gamma API)
// ---------------------------------------------------------------------------

/// A parent "event" from the grouped `/events` endpoint, with its sibling
/// markets nested inside.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GammaEvent {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    pub volume: Option<Decimal>,
    #[serde(default)]
    pub markets: Vec<GammaMarket>,
}

impl GammaEvent {
    pub fn as_event_group(&self) -> EventGroup {
        EventGroup {
            event_id: self.id.clone(),
            event_title: self.title.clone(),
            event_volume: self.volume,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GammaMarket {
    pub id: String,
    #[serde(default, alias = "conditionId")]
    pub condition_id: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    /// Stringified JSON array of outcome labels, e.g. `["Yes","No"]`.
    #[serde(default)]
    pub outcomes: Option<String>,
    /// Stringified JSON array of decimal strings, e.g. `["0.42","0.58"]`.
    #[serde(default, alias = "outcomePrices")]
    pub outcome_prices: Option<String>,
    /// Stringified JSON array of CLOB token ids, positionally aligned with
    /// `outcomes`.
    #[serde(default, alias = "clobTokenIds")]
    pub clob_token_ids: Option<String>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    pub volume: Option<Decimal>,
    #[serde(default, alias = "volume24hr", deserialize_with = "de_opt_decimal")]
    pub volume_24h: Option<Decimal>,
    #[serde(default, deserialize_with = "de_opt_decimal")]
    pub liquidity: Option<Decimal>,
    #[serde(default, alias = "endDate", alias = "endDateIso")]
    pub end_date: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub closed: Option<bool>,
    #[serde(default, alias = "enableOrderBook")]
    pub tradeable: Option<bool>,
    #[serde(default, alias = "acceptingOrders")]
    pub accepting_orders: Option<bool>,
    /// Explicit winning-outcome label, present once the catalog reflects
    /// resolution.
    #[serde(default, alias = "resolvedOutcome")]
    pub resolved_outcome: Option<String>,
}

impl GammaMarket {
    /// Parse the stringified outcome-label array.
    pub fn parse_outcomes(&self) -> Vec<String> {
        parse_string_array(self.outcomes.as_deref())
    }

    /// Parse the stringified token-id array.
    pub fn parse_token_ids(&self) -> Vec<String> {
        parse_string_array(self.clob_token_ids.as_deref())
    }

    /// Parse the stringified price array. Returns `None` when the array is
    /// absent, empty, unparseable, or the `[0,1]`/`[1,0]` placeholder pair —
    /// all of which mean "no real quote".
    pub fn parse_outcome_prices(&self) -> Option<Vec<Decimal>> {
        let raw = parse_string_array(self.outcome_prices.as_deref());
        if raw.is_empty() {
            return None;
        }
        let prices: Vec<Decimal> = raw
            .iter()
            .map(|s| Decimal::from_str(s))
            .collect::<Result<_, _>>()
            .ok()?;
        if is_placeholder_prices(&prices) {
            return None;
        }
        Some(prices)
    }

    pub fn parse_end_date(&self) -> Option<DateTime<Utc>> {
        self.end_date
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Convert into a store patch. Returns `None` only when the price array
    /// is empty/absent/placeholder, or misaligned with the outcome labels —
    /// the sole validity filter. Markets are never dropped for age, extreme
    /// prices, or a temporary non-tradeable flag.
    pub fn into_patch(&self, event: Option<&EventGroup>) -> Option<MarketPatch> {
        let outcomes = self.parse_outcomes();
        let prices = self.parse_outcome_prices()?;
        if prices.len() != outcomes.len() {
            tracing::debug!(
                market_id = %self.id,
                outcomes = outcomes.len(),
                prices = prices.len(),
                "Dropping market with misaligned price array"
            );
            return None;
        }

        let status = match self.closed {
            Some(true) => Some(MarketStatus::Closed),
            Some(false) => Some(MarketStatus::Active),
            None => None,
        };

        let mut patch = MarketPatch::new(self.id.clone());
        patch.condition_id = self.condition_id.clone();
        patch.title = self.question.clone();
        patch.slug = self.slug.clone();
        patch.outcomes = Some(outcomes);
        patch.outcome_prices = Some(prices);
        patch.status = status;
        patch.end_date = self.parse_end_date();
        patch.tradeable = self.tradeable;
        patch.accepting_orders = self.accepting_orders;
        patch.volume = self.volume;
        patch.volume_24h = self.volume_24h;
        patch.liquidity = self.liquidity;
        patch.event_group = event.cloned();
        let token_ids = self.parse_token_ids();
        if !token_ids.is_empty() {
            patch.token_ids = Some(token_ids);
        }
        Some(patch)
    }
}

/// A two-value pair of exactly `[0,1]` or `[1,0]` is the catalog's "no
/// quote yet" placeholder, not a real converged price.
pub fn is_placeholder_prices(prices: &[Decimal]) -> bool {
    prices.len() == 2
        && ((prices[0] == Decimal::ZERO && prices[1] == Decimal::ONE)
            || (prices[0] == Decimal::ONE && prices[1] == Decimal::ZERO))
}

fn parse_string_array(raw: Option<&str>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
        .unwrap_or_default()
}

/// The Gamma API is inconsistent about numerics: `/markets` returns decimal
/// strings while `/events` returns raw JSON numbers. Accept both.
fn de_opt_decimal<'de, D>(deserializer: D) -> Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(f64),
        Str(String),
    }

    Ok(match Option::<NumOrStr>::deserialize(deserializer)? {
        None => None,
        Some(NumOrStr::Num(n)) => Decimal::from_f64_retain(n),
        Some(NumOrStr::Str(s)) => Decimal::from_str(&s).ok(),
    })
}

// ---------------------------------------------------------------------------
// Streaming feed (CLOB WebSocket market channel)
// ---------------------------------------------------------------------------

/// One incoming stream message, tagged by `event_type`. Payloads that don't
/// match a known shape fall into `Unknown` and are dropped at the boundary
/// rather than coerced.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum StreamMessage {
    /// Full order-book snapshot for one token.
    Book {
        asset_id: String,
        #[serde(default)]
        market: Option<String>,
        #[serde(default)]
        timestamp: Option<String>,
        #[serde(default)]
        bids: Vec<BookLevel>,
        #[serde(default)]
        asks: Vec<BookLevel>,
    },
    /// Incremental top-of-book deltas, batched per message.
    PriceChange {
        #[serde(default)]
        market: Option<String>,
        #[serde(default)]
        timestamp: Option<String>,
        #[serde(default, alias = "changes")]
        price_changes: Vec<PriceChangeEntry>,
    },
    /// A trade print for one token.
    LastTradePrice {
        asset_id: String,
        #[serde(default)]
        market: Option<String>,
        #[serde(default)]
        timestamp: Option<String>,
        #[serde(default)]
        price: Option<String>,
        #[serde(default)]
        side: Option<String>,
        #[serde(default)]
        size: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookLevel {
    pub price: String,
    pub size: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceChangeEntry {
    pub asset_id: String,
    #[serde(default)]
    pub best_bid: Option<String>,
    #[serde(default)]
    pub best_ask: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub side: Option<String>,
}

/// Parse a stream message body, which may be a single object or an array of
/// objects. Non-message payloads (subscription acks etc.) yield an empty vec.
pub fn parse_stream_messages(text: &str) -> Vec<StreamMessage> {
    if let Ok(messages) = serde_json::from_str::<Vec<StreamMessage>>(text) {
        return messages;
    }
    if let Ok(message) = serde_json::from_str::<StreamMessage>(text) {
        return vec![message];
    }
    tracing::trace!(raw = %text, "Unrecognized stream payload");
    Vec::new()
}

/// Stream timestamps are millisecond-epoch strings; older message shapes
/// used second-epoch or ISO 8601. Accept all three.
pub fn parse_stream_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(n) = raw.parse::<i64>() {
        if n > 10_000_000_000 {
            return DateTime::from_timestamp_millis(n);
        }
        return DateTime::from_timestamp(n, 0);
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Best bid is the highest bid level, best ask the lowest ask level.
pub fn best_bid_ask(bids: &[BookLevel], asks: &[BookLevel]) -> Option<(Decimal, Decimal)> {
    let best_bid = bids
        .iter()
        .filter_map(|l| Decimal::from_str(&l.price).ok())
        .max()?;
    let best_ask = asks
        .iter()
        .filter_map(|l| Decimal::from_str(&l.price).ok())
        .min()?;
    Some((best_bid, best_ask))
}

// ---------------------------------------------------------------------------
// WebSocket subscribe / unsubscribe
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct WsSubscribe {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub assets_ids: Vec<String>,
    pub action: String,
}

impl WsSubscribe {
    pub fn subscribe(asset_ids: Vec<String>) -> Self {
        Self {
            msg_type: "market".into(),
            assets_ids: asset_ids,
            action: "subscribe".into(),
        }
    }

    pub fn unsubscribe(asset_ids: Vec<String>) -> Self {
        Self {
            msg_type: "market".into(),
            assets_ids: asset_ids,
            action: "unsubscribe".into(),
        }
    }
}
