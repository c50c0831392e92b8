//! goconnect-rs - Main Entry Point

use goconnect_rs::{Concentrator, ConcentratorConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("goconnect-rs v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "/etc/goconnect-rs/config.json".into());

    let config = ConcentratorConfig::load(&config_path).unwrap_or_else(|err| {
        tracing::error!(%err, path = %config_path, "failed to load configuration");
        std::process::exit(1);
    });

    let concentrator = Concentrator::new(config)?;
    concentrator.run().await?;

    Ok(())
}
