mod api;
mod config;
mod db;
mod error;
mod governor;
mod ingest;
mod pool;
mod scan;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::routes::{router, ApiState};
use crate::config::{Config, CHANNEL_CAPACITY};
use crate::db::{NotificationStore, ScanStore};
use crate::error::Result;
use crate::governor::RateGovernor;
use crate::ingest::{ChannelSource, IngestionWorker};
use crate::scan::{HttpPricingClient, ScanOrchestrator, ScanSettings};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let pool = db::connect(&cfg.db_path).await?;
    info!("Database ready at {}", cfg.db_path);

    let notifications = NotificationStore::new(pool.clone());
    let scans = ScanStore::new(pool.clone());
    let health = Arc::new(HealthState::new());

    // --- Scanning ---
    let governor = RateGovernor::new(cfg.rate_delays.clone(), cfg.rate_delay_default_ms);
    for (class, ms) in &cfg.rate_delays {
        info!(api_class = %class, min_delay_ms = ms, "rate governor class");
    }
    if cfg.pricing_api_token.is_none() {
        warn!("PRICING_API_TOKEN not set; pricing API calls are unauthenticated");
    }
    let client = HttpPricingClient::new(
        &cfg.pricing_api_url,
        cfg.pricing_api_token.clone(),
        Duration::from_secs(cfg.request_timeout_secs),
    )?;
    let orchestrator = ScanOrchestrator::new(
        scans.clone(),
        Arc::new(client),
        Arc::clone(&governor),
        ScanSettings::from_config(&cfg),
    );

    // --- Ingestion worker ---
    let (intake, source) = ChannelSource::new(CHANNEL_CAPACITY);
    let worker = IngestionWorker::new(
        Arc::new(source),
        notifications.clone(),
        cfg.severity,
        cfg.ingest_retry_policy(),
        cfg.worker_id.clone(),
        Arc::clone(&health),
    );
    tokio::spawn(async move { worker.run().await });

    // --- HTTP API server ---
    let api_state = ApiState {
        notifications,
        scans,
        orchestrator,
        intake,
        governor,
        health,
    };
    let app = router(api_state);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(worker_id = %cfg.worker_id, "HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
