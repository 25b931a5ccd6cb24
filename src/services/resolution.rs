use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::models::{MarketStatus, ResolutionStatus};

/// A price at or above this, with every other outcome at or below
/// [`LOSER_CEILING`], counts as a converged winner.
const WINNER_FLOOR: &str = "0.99";
const LOSER_CEILING: &str = "0.01";

/// What the detector sees for one market: the latest catalog payload merged
/// with the stored record. Borrowed views only — classification has no
/// store or network dependency.
#[derive(Debug, Clone)]
pub struct LifecycleInput<'a> {
    pub closed: bool,
    pub end_date: Option<DateTime<Utc>>,
    pub outcomes: &'a [String],
    pub outcome_prices: &'a [Decimal],
    pub explicit_outcome: Option<&'a str>,
}

/// The `(status, resolution_status, winning_outcome)` triple the lifecycle
/// sweep writes back through the upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleVerdict {
    pub status: MarketStatus,
    pub resolution_status: ResolutionStatus,
    pub winning_outcome: Option<usize>,
}

/// Classify one market's lifecycle state. Pure free function: three-way
/// split between still-open, recently-expired (with a grace window before
/// outcome extraction is attempted), and closed-early.
pub fn classify(input: &LifecycleInput<'_>, now: DateTime<Utc>, grace: Duration) -> LifecycleVerdict {
    let ended = input.end_date.map(|e| e <= now).unwrap_or(false);

    if ended {
        // Recently expired: within the grace window the outcome is not yet
        // authoritative, regardless of what prices look like.
        let end = input.end_date.unwrap_or(now);
        if now - end < grace {
            return LifecycleVerdict {
                status: MarketStatus::Closed,
                resolution_status: ResolutionStatus::Proposed,
                winning_outcome: None,
            };
        }
        return resolve_or_propose(input);
    }

    if input.closed {
        // Closed ahead of schedule (or with no end date at all); try to
        // extract an outcome immediately.
        return resolve_or_propose(input);
    }

    // Still open. A temporarily non-tradeable flag does not reach here at
    // all — it is not lifecycle state.
    LifecycleVerdict {
        status: MarketStatus::Active,
        resolution_status: ResolutionStatus::Pending,
        winning_outcome: None,
    }
}

fn resolve_or_propose(input: &LifecycleInput<'_>) -> LifecycleVerdict {
    match extract_winning_outcome(input.outcomes, input.outcome_prices, input.explicit_outcome) {
        Some(idx) => LifecycleVerdict {
            status: MarketStatus::Closed,
            resolution_status: ResolutionStatus::Resolved,
            winning_outcome: Some(idx),
        },
        None => LifecycleVerdict {
            status: MarketStatus::Closed,
            resolution_status: ResolutionStatus::Proposed,
            winning_outcome: None,
        },
    }
}

/// Extract the winning outcome index, if determinable. Precedence: an
/// explicit outcome label on the payload, then terminal-price convergence.
/// Pure free function with no receiver, so it stays independently testable.
pub fn extract_winning_outcome(
    outcomes: &[String],
    prices: &[Decimal],
    explicit: Option<&str>,
) -> Option<usize> {
    if let Some(label) = explicit {
        let label = label.trim();
        if !label.is_empty() {
            if let Some(idx) = outcomes
                .iter()
                .position(|o| o.eq_ignore_ascii_case(label))
            {
                return Some(idx);
            }
            tracing::warn!(label, "Explicit outcome label matches no outcome");
        }
    }

    converged_winner(prices)
}

/// Exactly one outcome priced at/above the winner floor with every other
/// outcome at/below the loser ceiling.
fn converged_winner(prices: &[Decimal]) -> Option<usize> {
    if prices.is_empty() {
        return None;
    }
    let floor = Decimal::from_str(WINNER_FLOOR).unwrap_or(Decimal::ONE);
    let ceiling = Decimal::from_str(LOSER_CEILING).unwrap_or(Decimal::ZERO);

    let mut winner: Option<usize> = None;
    for (idx, price) in prices.iter().enumerate() {
        if *price >= floor {
            if winner.is_some() {
                return None;
            }
            winner = Some(idx);
        } else if *price > ceiling {
            return None;
        }
    }
    winner
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn yes_no() -> Vec<String> {
        vec!["Yes".into(), "No".into()]
    }

    fn grace() -> Duration {
        Duration::hours(1)
    }

    #[test]
    fn test_open_market_stays_pending() {
        let outcomes = yes_no();
        let prices = [dec("0.42"), dec("0.58")];
        let input = LifecycleInput {
            closed: false,
            end_date: Some(Utc::now() + Duration::days(3)),
            outcomes: &outcomes,
            outcome_prices: &prices,
            explicit_outcome: None,
        };
        let v = classify(&input, Utc::now(), grace());
        assert_eq!(v.status, MarketStatus::Active);
        assert_eq!(v.resolution_status, ResolutionStatus::Pending);
        assert_eq!(v.winning_outcome, None);
    }

    #[test]
    fn test_high_confidence_open_market_stays_active() {
        // Near-certain prices on an open market are a valid quote, not a
        // reason to close or resolve anything.
        let outcomes = yes_no();
        let prices = [dec("0.004"), dec("0.996")];
        let input = LifecycleInput {
            closed: false,
            end_date: None,
            outcomes: &outcomes,
            outcome_prices: &prices,
            explicit_outcome: None,
        };
        let v = classify(&input, Utc::now(), grace());
        assert_eq!(v.status, MarketStatus::Active);
        assert_eq!(v.resolution_status, ResolutionStatus::Pending);
    }

    #[test]
    fn test_recently_expired_proposes_without_outcome() {
        // Expired 30 minutes ago, closed, no explicit outcome, flat prices.
        let outcomes = yes_no();
        let prices = [dec("0.5"), dec("0.5")];
        let now = Utc::now();
        let input = LifecycleInput {
            closed: true,
            end_date: Some(now - Duration::minutes(30)),
            outcomes: &outcomes,
            outcome_prices: &prices,
            explicit_outcome: None,
        };
        let v = classify(&input, now, grace());
        assert_eq!(v.status, MarketStatus::Closed);
        assert_eq!(v.resolution_status, ResolutionStatus::Proposed);
        assert_eq!(v.winning_outcome, None);
    }

    #[test]
    fn test_grace_window_blocks_even_converged_prices() {
        let outcomes = yes_no();
        let prices = [dec("0.99"), dec("0.01")];
        let now = Utc::now();
        let input = LifecycleInput {
            closed: true,
            end_date: Some(now - Duration::minutes(10)),
            outcomes: &outcomes,
            outcome_prices: &prices,
            explicit_outcome: None,
        };
        let v = classify(&input, now, grace());
        assert_eq!(v.resolution_status, ResolutionStatus::Proposed);
        assert_eq!(v.winning_outcome, None);
    }

    #[test]
    fn test_expired_past_grace_resolves_on_converged_prices() {
        let outcomes = yes_no();
        let prices = [dec("0.99"), dec("0.01")];
        let now = Utc::now();
        let input = LifecycleInput {
            closed: true,
            end_date: Some(now - Duration::hours(2)),
            outcomes: &outcomes,
            outcome_prices: &prices,
            explicit_outcome: None,
        };
        let v = classify(&input, now, grace());
        assert_eq!(v.resolution_status, ResolutionStatus::Resolved);
        assert_eq!(v.winning_outcome, Some(0));
    }

    #[test]
    fn test_expired_past_grace_without_convergence_stays_proposed() {
        let outcomes = yes_no();
        let prices = [dec("0.7"), dec("0.3")];
        let now = Utc::now();
        let input = LifecycleInput {
            closed: true,
            end_date: Some(now - Duration::hours(2)),
            outcomes: &outcomes,
            outcome_prices: &prices,
            explicit_outcome: None,
        };
        let v = classify(&input, now, grace());
        assert_eq!(v.resolution_status, ResolutionStatus::Proposed);
    }

    #[test]
    fn test_closed_early_resolves_immediately_with_label() {
        let outcomes = yes_no();
        let prices = [dec("0.5"), dec("0.5")];
        let input = LifecycleInput {
            closed: true,
            end_date: Some(Utc::now() + Duration::days(30)),
            outcomes: &outcomes,
            outcome_prices: &prices,
            explicit_outcome: Some("No"),
        };
        let v = classify(&input, Utc::now(), grace());
        assert_eq!(v.status, MarketStatus::Closed);
        assert_eq!(v.resolution_status, ResolutionStatus::Resolved);
        assert_eq!(v.winning_outcome, Some(1));
    }

    #[test]
    fn test_explicit_label_outranks_prices() {
        let outcomes = yes_no();
        // Prices say index 0, label says index 1; the label wins.
        assert_eq!(
            extract_winning_outcome(&outcomes, &[dec("0.99"), dec("0.01")], Some("no")),
            Some(1)
        );
    }

    #[test]
    fn test_unmatched_label_falls_back_to_prices() {
        let outcomes = yes_no();
        assert_eq!(
            extract_winning_outcome(&outcomes, &[dec("0.995"), dec("0.005")], Some("Maybe")),
            Some(0)
        );
    }

    #[test]
    fn test_no_convergence_without_clear_winner() {
        let outcomes = yes_no();
        assert_eq!(
            extract_winning_outcome(&outcomes, &[dec("0.95"), dec("0.05")], None),
            None
        );
        // Two "winners" is no winner.
        assert_eq!(converged_winner(&[dec("0.99"), dec("0.99")]), None);
        assert_eq!(converged_winner(&[]), None);
    }

    #[test]
    fn test_multi_outcome_convergence() {
        let prices = [dec("0.005"), dec("0.99"), dec("0.005")];
        assert_eq!(converged_winner(&prices), Some(1));
        // A straggler above the ceiling blocks resolution.
        let prices = [dec("0.05"), dec("0.99"), dec("0.005")];
        assert_eq!(converged_winner(&prices), None);
    }
}
