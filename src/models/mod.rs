pub mod market;
pub mod watch;

pub use market::{EventGroup, MarketPatch, MarketRecord, MarketSummary, UpsertResult};
pub use watch::WatchedMarket;

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Ingestion source
// ---------------------------------------------------------------------------

/// Which ingestion component produced a partial record. Field-level write
/// precedence in the upsert depends on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// REST catalog poller.
    Catalog,
    /// Live price stream.
    Stream,
    /// On-chain settlement feed. Outranks the catalog for resolution fields.
    Chain,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Catalog => "catalog",
            Source::Stream => "stream",
            Source::Chain => "chain",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Market lifecycle enums (stored as lowercase TEXT)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    Active,
    Closed,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Active => "active",
            MarketStatus::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(MarketStatus::Active),
            "closed" => Some(MarketStatus::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStatus {
    /// Market is open; no outcome determination has started.
    Pending,
    /// Market has closed or expired but the winning outcome is not yet
    /// authoritative.
    Proposed,
    /// Winning outcome is known. Terminal: a lower-precedence source can
    /// never revert this.
    Resolved,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStatus::Pending => "pending",
            ResolutionStatus::Proposed => "proposed",
            ResolutionStatus::Resolved => "resolved",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ResolutionStatus::Pending),
            "proposed" => Some(ResolutionStatus::Proposed),
            "resolved" => Some(ResolutionStatus::Resolved),
            _ => None,
        }
    }
}

impl fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SettlementEvent — delivered by the on-chain indexer
// ---------------------------------------------------------------------------

/// A settlement observed on chain: the condition id and the winning outcome,
/// either as a label matched against the stored outcome list or as a direct
/// index into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementEvent {
    pub condition_id: String,
    #[serde(default)]
    pub winning_outcome_label: Option<String>,
    #[serde(default)]
    pub winning_outcome_index: Option<i32>,
}
