use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

use super::types::{GammaEvent, GammaMarket};

const GAMMA_API_BASE: &str = "https://gamma-api.polymarket.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum GammaClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Unexpected(String),
}

impl GammaClientError {
    /// Rate limits and upstream 5xx/timeouts feed the poller's cycle
    /// pacing backoff; anything else is a plain per-fetch failure.
    pub fn is_transient(&self) -> bool {
        match self {
            GammaClientError::Http(e) => {
                if e.is_timeout() || e.is_connect() {
                    return true;
                }
                match e.status() {
                    Some(status) => {
                        status.as_u16() == 429 || status.is_server_error()
                    }
                    None => false,
                }
            }
            GammaClientError::Unexpected(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GammaClient {
    http: Client,
    base_url: String,
}

impl Default for GammaClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GammaClient {
    pub fn new() -> Self {
        Self::with_base_url(GAMMA_API_BASE.into())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self {
            http: Client::new(),
            base_url,
        }
    }

    /// Fetch one page of events (markets grouped under their parents),
    /// ordered by descending volume. Volume ordering is what keeps
    /// high-value old markets reachable under a page cap; identifier
    /// ordering would bury them.
    pub async fn list_events(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<GammaEvent>, GammaClientError> {
        let url = format!("{}/events", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .query(&[
                ("order", "volume"),
                ("ascending", "false"),
                ("closed", "false"),
                ("limit", &limit.to_string()),
                ("offset", &offset.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let events: Vec<GammaEvent> = resp.json().await?;
        Ok(events)
    }

    /// Bulk fetch of markets by id list (comma-joined), used by the tiered
    /// standalone pass to stay inside upstream rate limits.
    pub async fn get_markets_by_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<GammaMarket>, GammaClientError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/markets", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .query(&[("ids", ids.join(","))])
            .send()
            .await?
            .error_for_status()?;

        let markets: Vec<GammaMarket> = resp.json().await?;
        Ok(markets)
    }
}
