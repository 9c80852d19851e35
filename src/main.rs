use anyhow::Result;
use clap::Parser;
use log::{error, info};
use spot_grid_bot::config::load_config;
use spot_grid_bot::engine::ReconciliationEngine;
use spot_grid_bot::exchange::paper::PaperExchange;
use spot_grid_bot::risk::RiskManager;
use spot_grid_bot::state::StateStore;
use spot_grid_bot::ui::console::ConsoleRenderer;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Spot Grid Trading Bot", long_about = None)]
struct Args {
    #[arg(short, long)]
    config: Option<String>,

    /// Interactively create a new grid configuration
    #[arg(long)]
    create: bool,

    /// Print the grid a configuration would place, without running
    #[arg(long)]
    preview: bool,
}

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[tokio::main]
async fn main() -> Result<()> {
    // ---------------------------------------------------------
    // 1. Setup Logging (Tracing)
    // ---------------------------------------------------------
    let file_appender = tracing_appender::rolling::daily("logs", "application.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Console Layer (Env Filter)
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("spot_grid_bot=debug".parse().unwrap()),
        );

    // File Layer (Simple Text)
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_target(false)
        .with_filter(tracing_subscriber::EnvFilter::new(
            "info,spot_grid_bot=debug",
        ));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    // Optional .env overrides (state dir, symbol).
    let _ = dotenvy::dotenv();

    // ---------------------------------------------------------
    // 2. Setup Audit Logger
    // ---------------------------------------------------------
    let audit_logger = match spot_grid_bot::logging::trade_audit::TradeAuditLogger::new("logs") {
        Ok(l) => Some(l),
        Err(e) => {
            error!("Failed to initialize Trade Audit Logger: {}", e);
            None
        }
    };

    let args = Args::parse();

    if args.create {
        if let Err(e) = spot_grid_bot::config::creator::create_config() {
            error!("Error creating config: {}", e);
            std::process::exit(1);
        }
        return Ok(());
    }

    let config_path = args
        .config
        .ok_or_else(|| anyhow::anyhow!("Config file is required unless --create is used"))?;

    info!("Loading config from: {}", config_path);
    let config = load_config(&config_path)?;

    // --- PREVIEW MODE ---
    if args.preview {
        info!("[PREVIEW] Rendering grid for {}...", config.symbol);
        let preview_price = config
            .paper
            .start_price
            .unwrap_or((config.lower_price + config.upper_price) / 2.0);
        ConsoleRenderer::render(&config, preview_price)?;
        return Ok(());
    }

    // --- TRADING MODE ---
    info!(
        "Starting grid engine for {} ({} levels in [{:.6}, {:.6}])",
        config.symbol,
        config.grid_count + 1,
        config.lower_price,
        config.upper_price
    );

    let rules = spot_grid_bot::constants::DEFAULT_INSTRUMENT_RULES;
    let exchange = Arc::new(PaperExchange::from_config(&config, rules));
    let risk = Arc::new(RiskManager::new(exchange.clone(), &config));
    let store = StateStore::new(config.state_dir.clone());

    let mut engine =
        ReconciliationEngine::new(config, exchange, risk, store, audit_logger).await?;

    if let Err(e) = engine.run().await {
        error!("Engine error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
