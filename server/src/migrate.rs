use anyhow::Context;
use tally_core::JobStore;

use crate::config::ServerConfig;

/// Run store migrations and exit. `serve` migrates on boot as well; this
/// exists for provisioning a database ahead of first start.
pub async fn run(cfg: &ServerConfig) -> anyhow::Result<()> {
    let store = JobStore::connect(&cfg.database_url, cfg.store_pool_size)
        .await
        .context("open job store")?;
    store.migrate().await.context("run migrations")?;
    tracing::info!("migrations complete");
    Ok(())
}
