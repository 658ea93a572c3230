use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tally_core::{JobQueue, JobService, JobStore};

use crate::config::ServerConfig;

/// Submit a local file straight through the core.
///
/// This exists purely to make manual testing ergonomic: with `serve` running
/// in another terminal you can push jobs without building multipart requests.
/// The queue hint lands in this process and dies with it. That is fine: the
/// running server's reaper re-enqueues the pending row.
pub async fn run(cfg: &ServerConfig, path: &Path) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    let text = String::from_utf8(bytes)
        .with_context(|| format!("{} is not valid UTF-8", path.display()))?;

    let store = Arc::new(
        JobStore::connect(&cfg.database_url, cfg.store_pool_size)
            .await
            .context("open job store")?,
    );
    store.migrate().await.context("migrate job store")?;

    let queue = Arc::new(JobQueue::new(1));
    let service = JobService::new(store, queue, cfg.max_text_bytes);

    let id = service.submit(text).await.context("submit job")?;
    println!("submitted job {id}");
    Ok(())
}
