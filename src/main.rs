use tokio::sync::{mpsc, watch};

use polysync::api::create_router;
use polysync::config::AppConfig;
use polysync::db;
use polysync::ingestion::settlement::run_settlement_consumer;
use polysync::ingestion::streamer::{run_price_streamer, StreamerConfig};
use polysync::metrics::init_metrics;
use polysync::models::SettlementEvent;
use polysync::polymarket::GammaClient;
use polysync::services::poller::{run_catalog_poller, PollerConfig};
use polysync::services::subscriptions::{run_subscription_refresher, TokenSubscription};
use polysync::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    let addr = format!("{}:{}", config.host, config.port);
    let metrics_handle = init_metrics();

    tracing::info!("Connecting to database...");
    let db = db::init_pool(&config.database_url).await?;
    tracing::info!("Database connected");

    // Cooperative shutdown: flipped once on SIGINT, observed by every task.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    // --- Catalog poller ---
    let gamma = GammaClient::with_base_url(config.gamma_api_url.clone());
    let poller_cfg = PollerConfig {
        interval_secs: config.poll_interval_secs,
        event_pages: config.event_pages,
        page_size: config.page_size,
        batch_size: config.batch_size,
        fetch_concurrency: config.fetch_concurrency,
        lifecycle_limit: config.lifecycle_limit,
        grace_window_secs: config.grace_window_secs,
        watch_ttl_secs: config.watch_ttl_secs,
        ..PollerConfig::default()
    };
    {
        let pool = db.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            run_catalog_poller(gamma, pool, poller_cfg, shutdown).await;
        });
    }

    // --- Price stream: subscription refresher feeding the streamer ---
    let (sub_tx, sub_rx) = watch::channel::<Vec<TokenSubscription>>(Vec::new());
    {
        let pool = db.clone();
        let shutdown = shutdown_rx.clone();
        let refresh_secs = config.subscription_refresh_secs;
        let top_volume = config.top_volume_subscriptions;
        let active_window = config.active_trade_window_secs;
        tokio::spawn(async move {
            run_subscription_refresher(pool, sub_tx, refresh_secs, top_volume, active_window, shutdown)
                .await;
        });
    }
    {
        let pool = db.clone();
        let shutdown = shutdown_rx.clone();
        let streamer_cfg = StreamerConfig {
            ws_url: config.polymarket_ws_url.clone(),
            stale_threshold_secs: config.stale_threshold_secs,
        };
        tokio::spawn(async move {
            run_price_streamer(streamer_cfg, pool, sub_rx, shutdown).await;
        });
    }

    // --- Settlement feed consumer ---
    let (settlement_tx, settlement_rx) = mpsc::channel::<SettlementEvent>(500);
    {
        let pool = db.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            run_settlement_consumer(settlement_rx, pool, shutdown).await;
        });
    }

    let state = AppState {
        db,
        config,
        metrics_handle,
        settlement_tx,
    };
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {addr}");

    let mut shutdown = shutdown_rx;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            // Already-flipped flag counts; otherwise wait for the flip.
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();
}
