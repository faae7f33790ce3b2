//! Candlemind server - headless trading-agent simulation engine.
//!
//! Runs the backtest and forward session engines behind a WebSocket
//! streaming endpoint. Sessions are driven by agents stored in the database;
//! consumers connect to `ws://bind_addr/{session_id}` for live events and
//! send pause/resume/stop commands over the same connection.

use anyhow::Result;
use candlemind::application::backtest::BacktestEngine;
use candlemind::application::forward::ForwardEngine;
use candlemind::config::Config;
use candlemind::infrastructure::credentials::PassthroughCipher;
use candlemind::infrastructure::event_bus::EventBus;
use candlemind::infrastructure::market_data::BinanceMarketDataGateway;
use candlemind::infrastructure::openrouter::OpenRouterProviderFactory;
use candlemind::infrastructure::persistence::{Database, Repositories};
use candlemind::infrastructure::ws_server::WsServer;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{Level, info};
use tracing_subscriber::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "candlemind", about = "AI trading-agent simulation engine")]
struct Args {
    /// Listen address for the WebSocket endpoint (overrides BIND_ADDR).
    #[arg(long)]
    bind: Option<String>,

    /// Database URL (overrides DATABASE_URL).
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let stdout_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(stdout_layer)
        .init();

    info!("Candlemind {} starting...", env!("CARGO_PKG_VERSION"));

    let mut config = Config::from_env()?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(database_url) = args.database_url {
        config.database_url = database_url;
    }
    info!(
        "Configuration loaded: bind={}, db={}",
        config.bind_addr, config.database_url
    );

    let db = Database::new(&config.database_url).await?;
    let repos = Repositories::sqlite(&db);

    let bus = EventBus::new();
    bus.spawn_reaper(
        Duration::from_secs(60),
        Duration::from_secs(config.heartbeat_max_age_secs),
    );

    let gateway = Arc::new(
        BinanceMarketDataGateway::builder()
            .base_url(config.market_data_base_url.clone())
            .build(),
    );
    let cipher = Arc::new(PassthroughCipher);
    let providers = Arc::new(OpenRouterProviderFactory::new(config.llm_settings()));

    let backtest = Arc::new(BacktestEngine::new(
        repos.clone(),
        bus.clone(),
        gateway.clone(),
        cipher.clone(),
        providers.clone(),
    ));
    let forward = Arc::new(ForwardEngine::new(
        repos,
        bus.clone(),
        gateway,
        cipher,
        providers,
    ));

    let listener = TcpListener::bind(&config.bind_addr).await?;
    let server = Arc::new(WsServer::new(bus, backtest, forward));
    tokio::spawn(server.run(listener));

    info!("Server running. Press Ctrl+C to shutdown.");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting...");

    Ok(())
}
