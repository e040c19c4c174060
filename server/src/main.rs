use ai_relay::HttpRelay;
use anyhow::{Context, Result};
use clap::Parser;
use health_assistant::{
    api::{self, AppState},
    config,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use url::Url;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = config::Cli::parse();
    let cfg = config::Config::load(&cli)?;
    let level = if cfg.logging_enabled { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    let relay_url = Url::parse(&cfg.relay.url).context("invalid relay url")?;
    let relay = HttpRelay::new(relay_url, cfg.relay.timeout).context("build relay client")?;
    let state = AppState::new(cfg, Arc::new(relay)).await?;
    api::run_http_server(state).await
}
