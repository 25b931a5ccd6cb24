pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod ingestion;
pub mod metrics;
pub mod models;
pub mod polymarket;
pub mod retry;
pub mod services;

use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::models::SettlementEvent;

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub config: AppConfig,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
    pub settlement_tx: mpsc::Sender<SettlementEvent>,
}
