use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashSet;

use crate::models::MarketSummary;

/// Tier thresholds and rotation lengths for the standalone fetch pass.
///
/// Rotation N means the tier is split round-robin across N cycles, so with
/// the default 60s cycle the high-volume tier is fully refreshed every
/// cycle, the mid tier roughly every 10 minutes, and the long tail on a
/// multi-hour loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Tier-1 horizon: markets ending within this window refresh every cycle.
    pub expiry_horizon: Duration,
    /// 24h volume at or above this lands in the high tier.
    pub high_volume_floor: Decimal,
    /// 24h volume at or above this (but below the high floor) lands in the
    /// mid tier; everything below is long tail.
    pub mid_volume_floor: Decimal,
    pub high_rotation: u64,
    pub mid_rotation: u64,
    pub tail_rotation: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            expiry_horizon: Duration::hours(2),
            high_volume_floor: Decimal::from(100_000),
            mid_volume_floor: Decimal::from(5_000),
            high_rotation: 1,
            mid_rotation: 10,
            tail_rotation: 180,
        }
    }
}

/// The id lists Pass B fetches this cycle, in tier order.
#[derive(Debug, Clone, Default)]
pub struct FetchPlan {
    /// Tier 0: watched markets with open interest. Non-negotiable freshness.
    pub watched: Vec<String>,
    /// Tier 1: markets expiring within the horizon.
    pub expiring: Vec<String>,
    /// Tier 2: high-volume rotation slice.
    pub high_volume: Vec<String>,
    /// Tier 3: mid-volume rotation slice.
    pub mid_volume: Vec<String>,
    /// Tier 4: long-tail rotation slice.
    pub long_tail: Vec<String>,
}

impl FetchPlan {
    pub fn total(&self) -> usize {
        self.watched.len()
            + self.expiring.len()
            + self.high_volume.len()
            + self.mid_volume.len()
            + self.long_tail.len()
    }

    /// All ids in tier order. Tiers are disjoint by construction.
    pub fn all_ids(&self) -> Vec<String> {
        let mut ids = Vec::with_capacity(self.total());
        ids.extend_from_slice(&self.watched);
        ids.extend_from_slice(&self.expiring);
        ids.extend_from_slice(&self.high_volume);
        ids.extend_from_slice(&self.mid_volume);
        ids.extend_from_slice(&self.long_tail);
        ids
    }
}

/// Build the Pass B fetch plan for one cycle. Pure function over the watch
/// list and scheduling summaries; cycle state lives with the caller, not in
/// any global.
///
/// Markets already touched by the grouped pass this cycle are excluded from
/// every tier (they are fresh; fetching them again only burns rate limit).
/// Each market appears in at most one tier.
pub fn build_fetch_plan(
    cycle: u64,
    watched: &[String],
    summaries: &[MarketSummary],
    touched_in_pass_a: &HashSet<String>,
    now: DateTime<Utc>,
    cfg: &SchedulerConfig,
) -> FetchPlan {
    let mut plan = FetchPlan::default();
    let mut taken: HashSet<&str> = HashSet::new();

    for id in watched {
        if touched_in_pass_a.contains(id) || !taken.insert(id.as_str()) {
            continue;
        }
        plan.watched.push(id.clone());
    }

    let mut high: Vec<&MarketSummary> = Vec::new();
    let mut mid: Vec<&MarketSummary> = Vec::new();
    let mut tail: Vec<&MarketSummary> = Vec::new();

    for summary in summaries {
        if touched_in_pass_a.contains(&summary.market_id)
            || taken.contains(summary.market_id.as_str())
        {
            continue;
        }

        let expiring = summary
            .end_date
            .map(|e| e > now && e - now <= cfg.expiry_horizon)
            .unwrap_or(false);
        if expiring && !summary.resolved {
            taken.insert(summary.market_id.as_str());
            plan.expiring.push(summary.market_id.clone());
            continue;
        }

        if summary.volume_24h >= cfg.high_volume_floor {
            high.push(summary);
        } else if summary.volume_24h >= cfg.mid_volume_floor {
            mid.push(summary);
        } else {
            tail.push(summary);
        }
    }

    plan.high_volume = rotation_slice(&high, cycle, cfg.high_rotation);
    plan.mid_volume = rotation_slice(&mid, cycle, cfg.mid_rotation);
    plan.long_tail = rotation_slice(&tail, cycle, cfg.tail_rotation);

    plan
}

/// Stable round-robin slice of a tier: sort by id, then take every entry
/// whose index lands on this cycle's residue. Over `rotation` consecutive
/// cycles the whole tier is covered exactly once.
fn rotation_slice(bucket: &[&MarketSummary], cycle: u64, rotation: u64) -> Vec<String> {
    let rotation = rotation.max(1);
    let mut ids: Vec<&str> = bucket.iter().map(|s| s.market_id.as_str()).collect();
    ids.sort_unstable();
    ids.into_iter()
        .enumerate()
        .filter(|(idx, _)| (*idx as u64) % rotation == cycle % rotation)
        .map(|(_, id)| id.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: &str, volume: i64, end_in_minutes: Option<i64>) -> MarketSummary {
        MarketSummary {
            market_id: id.into(),
            volume_24h: Decimal::from(volume),
            end_date: end_in_minutes.map(|m| Utc::now() + Duration::minutes(m)),
            resolved: false,
        }
    }

    #[test]
    fn test_watched_markets_always_in_tier_zero() {
        let watched = vec!["w1".to_string(), "w2".to_string()];
        let summaries = vec![summary("w1", 1_000_000, None), summary("m1", 50, None)];
        let plan = build_fetch_plan(
            0,
            &watched,
            &summaries,
            &HashSet::new(),
            Utc::now(),
            &SchedulerConfig::default(),
        );
        assert_eq!(plan.watched, vec!["w1", "w2"]);
        // w1 is not also scheduled in a volume tier.
        assert!(!plan.high_volume.contains(&"w1".to_string()));
    }

    #[test]
    fn test_pass_a_touched_excluded_everywhere() {
        let watched = vec!["w1".to_string()];
        let summaries = vec![summary("w1", 1_000_000, None), summary("m1", 1_000_000, None)];
        let touched: HashSet<String> = ["w1".to_string(), "m1".to_string()].into();
        let plan = build_fetch_plan(
            0,
            &watched,
            &summaries,
            &touched,
            Utc::now(),
            &SchedulerConfig::default(),
        );
        assert_eq!(plan.total(), 0);
    }

    #[test]
    fn test_expiring_markets_take_tier_one() {
        let summaries = vec![
            summary("soon", 10, Some(30)),
            summary("later", 10, Some(60 * 24)),
            summary("past", 10, Some(-30)),
        ];
        let plan = build_fetch_plan(
            0,
            &[],
            &summaries,
            &HashSet::new(),
            Utc::now(),
            &SchedulerConfig::default(),
        );
        assert_eq!(plan.expiring, vec!["soon"]);
        // Already-ended markets are lifecycle-sweep territory, not tier 1;
        // they still rotate through the volume tiers.
        assert!(plan.long_tail.contains(&"past".to_string()));
    }

    #[test]
    fn test_volume_buckets() {
        let summaries = vec![
            summary("big", 500_000, None),
            summary("mid", 50_000, None),
            summary("small", 50, None),
        ];
        let plan = build_fetch_plan(
            0,
            &[],
            &summaries,
            &HashSet::new(),
            Utc::now(),
            &SchedulerConfig::default(),
        );
        assert_eq!(plan.high_volume, vec!["big"]);
        assert_eq!(plan.mid_volume, vec!["mid"]);
        assert_eq!(plan.long_tail, vec!["small"]);
    }

    #[test]
    fn test_rotation_covers_tier_exactly_once() {
        let summaries: Vec<MarketSummary> = (0..25)
            .map(|i| summary(&format!("m{i:02}"), 50_000, None))
            .collect();
        let cfg = SchedulerConfig::default(); // mid_rotation = 10

        let mut seen: Vec<String> = Vec::new();
        for cycle in 0..10 {
            let plan = build_fetch_plan(
                cycle,
                &[],
                &summaries,
                &HashSet::new(),
                Utc::now(),
                &cfg,
            );
            seen.extend(plan.mid_volume);
        }
        seen.sort();
        let expected: Vec<String> = (0..25).map(|i| format!("m{i:02}")).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_high_tier_refreshes_every_cycle() {
        let summaries = vec![summary("big1", 500_000, None), summary("big2", 500_000, None)];
        let cfg = SchedulerConfig::default();
        for cycle in 0..3 {
            let plan =
                build_fetch_plan(cycle, &[], &summaries, &HashSet::new(), Utc::now(), &cfg);
            assert_eq!(plan.high_volume.len(), 2);
        }
    }
}
