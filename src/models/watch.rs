use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Database row for the watched_markets table. A market lands here when an
/// external collaborator (the position tracker) registers interest — an open
/// position referencing it. The poller's tier 0 and the streamer's
/// subscription set are both built from rows with a positive count.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WatchedMarket {
    pub market_id: String,
    pub active_interest_count: i32,
    pub last_interest_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
