use anyhow::{Context, Result};
use pipeline_app::config::Config;
use pipeline_app::lifecycle::PipelineSystem;
use pipeline_app::market::SyntheticMarket;
use pipeline_core::telemetry::setup_tracing;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    setup_tracing(&config.log_level);
    info!(?config, "Configuration loaded");

    let market = Arc::new(SyntheticMarket::new(config.tickers.clone(), config.outage_rate));
    let system = PipelineSystem::start(&config, market).await?;

    tokio::signal::ctrl_c().await.context("can't listen for shutdown signal")?;
    info!("Shutdown signal received");

    system.shutdown().await
}
