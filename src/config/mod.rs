use std::env;

const DEFAULT_GAMMA_URL: &str = "https://gamma-api.polymarket.com";
const DEFAULT_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub api_token: String,

    // Catalog polling
    pub gamma_api_url: String,
    pub poll_interval_secs: u64,
    pub event_pages: u32,
    pub page_size: u32,
    pub batch_size: usize,
    pub fetch_concurrency: usize,
    pub lifecycle_limit: i64,
    pub grace_window_secs: i64,

    // Price stream
    pub polymarket_ws_url: String,
    pub stale_threshold_secs: i64,
    pub subscription_refresh_secs: u64,
    pub top_volume_subscriptions: i64,
    pub active_trade_window_secs: f64,

    // Watch list
    pub watch_ttl_secs: f64,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?,
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".into())
                .parse()?,
            api_token: env::var("API_TOKEN").unwrap_or_default(),

            gamma_api_url: env::var("GAMMA_API_URL").unwrap_or_else(|_| DEFAULT_GAMMA_URL.into()),
            poll_interval_secs: parse_env("POLL_INTERVAL_SECS", 60),
            event_pages: parse_env("EVENT_PAGES", 3),
            page_size: parse_env("PAGE_SIZE", 100),
            batch_size: parse_env("BATCH_SIZE", 50),
            fetch_concurrency: parse_env("FETCH_CONCURRENCY", 4),
            lifecycle_limit: parse_env("LIFECYCLE_LIMIT", 500),
            grace_window_secs: parse_env("GRACE_WINDOW_SECS", 3_600),

            polymarket_ws_url: env::var("POLYMARKET_WS_URL")
                .unwrap_or_else(|_| DEFAULT_WS_URL.into()),
            stale_threshold_secs: parse_env("STALE_THRESHOLD_SECS", 60),
            subscription_refresh_secs: parse_env("SUBSCRIPTION_REFRESH_SECS", 60),
            top_volume_subscriptions: parse_env("TOP_VOLUME_SUBSCRIPTIONS", 200),
            active_trade_window_secs: parse_env("ACTIVE_TRADE_WINDOW_SECS", 86_400.0),

            watch_ttl_secs: parse_env("WATCH_TTL_SECS", 86_400.0),
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_falls_back_on_missing_or_bad_value() {
        std::env::remove_var("POLYSYNC_TEST_MISSING");
        assert_eq!(parse_env("POLYSYNC_TEST_MISSING", 42u64), 42);

        std::env::set_var("POLYSYNC_TEST_BAD", "not-a-number");
        assert_eq!(parse_env("POLYSYNC_TEST_BAD", 7u64), 7);
        std::env::remove_var("POLYSYNC_TEST_BAD");
    }
}
