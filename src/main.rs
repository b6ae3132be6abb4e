//! catalog-core daemon
//!
//! Loads configuration from the environment, starts the catalog and runs
//! until Ctrl-C.

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use catalog_core::{CatalogManager, Config};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "catalog_core=info".into());
    let pretty = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("pretty"));

    let registry = tracing_subscriber::registry().with(filter);
    if pretty {
        registry.with(tracing_subscriber::fmt::layer().pretty()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!(
        database = %config.database_url,
        roots = config.watched_roots.len(),
        realtime = config.enable_realtime,
        "Configuration loaded"
    );

    let manager = CatalogManager::from_config(config)
        .await
        .context("failed to initialise catalog")?;
    manager.start().await.context("failed to start catalog")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    manager.stop().await;
    manager.database().close().await;
    tracing::info!("Catalog stopped");
    Ok(())
}
