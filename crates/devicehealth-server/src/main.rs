//! Device health server binary

use common::logging::{self, LogFormat};
use devicehealth_server::{Config, HealthServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first (needed for logging settings)
    let (config, load_error) = match Config::load() {
        Ok(cfg) => (cfg, None),
        Err(e) => (Config::default(), Some(e)),
    };

    logging::init(
        config.logging.level.as_deref().unwrap_or("info"),
        LogFormat::from_name(config.logging.format.as_deref()),
    );

    match load_error {
        Some(e) => {
            tracing::error!(error = %e, "Configuration error, using default configuration");
        }
        None => tracing::info!("Configuration loaded successfully"),
    }

    tracing::info!("Device health server starting");

    HealthServer::new(config).run().await
}
