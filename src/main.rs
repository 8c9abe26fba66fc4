//! RelayPass Server - Main Entry Point
//!
//! Token-brokered SMTP relay sessions and bulk dispatch

use anyhow::Result;
use relaypass_server::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("relaypass_server=debug".parse()?),
        )
        .init();

    let config = Config::from_env();
    print_banner(&config);

    // Run the server
    relaypass_server::run_server(config).await?;

    Ok(())
}

fn print_banner(config: &Config) {
    info!("╔═══════════════════════════════════════════════════╗");
    info!("║   RelayPass                                       ║");
    info!("║   token-brokered SMTP relay sessions              ║");
    info!("╚═══════════════════════════════════════════════════╝");
    info!(
        relay = %format!("{}:{}", config.default_relay_host, config.default_relay_port),
        send_delay_ms = config.send_delay_ms,
        max_repeat = config.max_repeat,
        "session keys are process-local; a restart invalidates all tokens"
    );
}
