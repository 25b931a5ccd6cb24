use metrics::counter;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::db::market_repo::{self, StoreError};
use crate::models::{MarketPatch, MarketRecord, MarketStatus, ResolutionStatus, SettlementEvent, Source};

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("settlement event for condition {0} carries no outcome")]
    MissingOutcome(String),

    #[error("outcome label {label:?} not found in market {market_id}")]
    UnknownLabel { market_id: String, label: String },

    #[error("outcome index {index} out of range for market {market_id} with {outcomes} outcomes")]
    IndexOutOfRange {
        market_id: String,
        index: i32,
        outcomes: usize,
    },

    #[error(
        "settlement for {market_id} disagrees with resolved record: stored winner {stored}, chain winner {proposed}"
    )]
    Disagreement {
        market_id: String,
        stored: i32,
        proposed: i32,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Db(#[from] anyhow::Error),
}

#[derive(Debug)]
pub struct AppliedSettlement {
    pub market_id: String,
    pub winning_outcome: i32,
    pub changed: bool,
}

/// Resolve the winning outcome index for a known record: an explicit index
/// wins, otherwise the label is matched case-insensitively against the
/// stored outcome list.
fn winning_index(record: &MarketRecord, event: &SettlementEvent) -> Result<i32, SettlementError> {
    if let Some(index) = event.winning_outcome_index {
        if index < 0 || (!record.outcomes.is_empty() && index as usize >= record.outcomes.len()) {
            return Err(SettlementError::IndexOutOfRange {
                market_id: record.market_id.clone(),
                index,
                outcomes: record.outcomes.len(),
            });
        }
        return Ok(index);
    }
    let label = event
        .winning_outcome_label
        .as_deref()
        .ok_or_else(|| SettlementError::MissingOutcome(event.condition_id.clone()))?;
    record
        .outcomes
        .iter()
        .position(|o| o.eq_ignore_ascii_case(label))
        .map(|i| i as i32)
        .ok_or_else(|| SettlementError::UnknownLabel {
            market_id: record.market_id.clone(),
            label: label.to_string(),
        })
}

/// Apply one on-chain settlement. Chain data outranks the catalog, so this
/// always writes `resolved` with the winner. A record already resolved to a
/// different winner is an invariant violation: the stored record is left
/// untouched and the conflict surfaces as an error.
///
/// A settlement for a condition the catalog has never returned creates a
/// provisional record keyed by the condition id; the next catalog fetch
/// fills in the descriptive fields.
pub async fn apply_settlement(
    pool: &PgPool,
    event: &SettlementEvent,
) -> Result<AppliedSettlement, SettlementError> {
    let existing = market_repo::get_market_by_condition(pool, &event.condition_id).await?;

    let (patch, winner) = match existing {
        Some(record) => {
            let winner = winning_index(&record, event)?;
            if record.is_resolved() {
                if let Some(stored) = record.winning_outcome {
                    if stored != winner {
                        return Err(SettlementError::Disagreement {
                            market_id: record.market_id,
                            stored,
                            proposed: winner,
                        });
                    }
                }
            }
            let mut patch = MarketPatch::new(record.market_id.clone());
            patch.condition_id = Some(event.condition_id.clone());
            (patch, winner)
        }
        None => {
            // Never catalogued. Key the provisional row by condition id so
            // the settlement is not lost; carry the label as the outcome
            // list when that is all the chain gives us.
            let mut patch = MarketPatch::new(event.condition_id.clone());
            patch.condition_id = Some(event.condition_id.clone());
            let winner = match (event.winning_outcome_index, &event.winning_outcome_label) {
                (Some(index), _) => index,
                (None, Some(label)) => {
                    patch.outcomes = Some(vec![label.clone()]);
                    0
                }
                (None, None) => {
                    return Err(SettlementError::MissingOutcome(event.condition_id.clone()))
                }
            };
            (patch, winner)
        }
    };

    let mut patch = patch;
    patch.status = Some(MarketStatus::Closed);
    patch.resolution_status = Some(ResolutionStatus::Resolved);
    patch.winning_outcome = Some(winner);

    let result = market_repo::upsert(pool, &patch, Source::Chain).await?;
    Ok(AppliedSettlement {
        market_id: patch.market_id,
        winning_outcome: winner,
        changed: result.changed,
    })
}

/// Drain settlement events from the feed until shutdown. Individual bad
/// events are logged and dropped; the consumer never dies on one.
pub async fn run_settlement_consumer(
    mut rx: mpsc::Receiver<SettlementEvent>,
    pool: PgPool,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("Settlement consumer started");
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else {
                    tracing::info!("Settlement feed closed");
                    return;
                };
                match apply_settlement(&pool, &event).await {
                    Ok(applied) => {
                        counter!("settlement_events_total").increment(1);
                        if applied.changed {
                            tracing::info!(
                                market_id = %applied.market_id,
                                winning_outcome = applied.winning_outcome,
                                "Settlement applied"
                            );
                        }
                    }
                    Err(SettlementError::Disagreement { ref market_id, stored, proposed }) => {
                        counter!("invariant_violations_total").increment(1);
                        tracing::error!(
                            %market_id,
                            stored,
                            proposed,
                            "Settlement conflicts with resolved record — skipping"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            condition_id = %event.condition_id,
                            error = %e,
                            "Failed to apply settlement"
                        );
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("Settlement consumer stopping");
                    return;
                }
            }
        }
    }
}
