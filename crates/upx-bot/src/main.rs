//! Upbit execution engine - Entry Point

use anyhow::Result;
use clap::Parser;
use tracing::info;
use upx_telemetry::LogFormat;

/// Upbit execution engine
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via UPX_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // TLS crypto provider must be installed before any stream connects
    upx_ws::init_crypto();

    let args = Args::parse();

    upx_telemetry::init_logging(LogFormat::from_env())?;

    info!("Starting upx-bot v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > UPX_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("UPX_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");
    let config = upx_bot::AppConfig::from_file(&config_path)?;
    info!(
        base_url = %config.rest.base_url,
        order_timeout_secs = config.orders.order_timeout_secs,
        recon_interval_secs = config.recon.interval_secs,
        public_subscriptions = config.stream.subscriptions.len(),
        "Configuration loaded"
    );

    upx_bot::Application::new(config).run().await?;

    Ok(())
}
