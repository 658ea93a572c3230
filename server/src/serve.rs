//! Process bootstrap: store, queue, core, HTTP adapter, supervisor.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tally_core::{JobQueue, JobService, JobStore};

use crate::api::ApiServer;
use crate::config::ServerConfig;
use crate::supervisor::Supervisor;

pub async fn run(cfg: &ServerConfig) -> anyhow::Result<()> {
    let (server, supervisor) = start(cfg.clone()).await?;
    tracing::info!(addr = %server.addr, "tally server listening");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!(event = "tally.server.shutdown", "shutting down");

    server.shutdown().await?;
    supervisor.shutdown().await?;
    Ok(())
}

/// Build and start every component. Returns the handles so tests can drive
/// the full stack on an ephemeral port and shut it down deterministically.
pub async fn start(cfg: ServerConfig) -> anyhow::Result<(ApiServer, Supervisor)> {
    cfg.validate()?;

    let store = Arc::new(
        JobStore::connect(&cfg.database_url, cfg.store_pool_size)
            .await
            .context("open job store")?,
    );
    store.migrate().await.context("migrate job store")?;

    let queue = Arc::new(JobQueue::new(cfg.queue_capacity));

    // Jobs that were pending at last shutdown lost their queue hints with the
    // process; seed the queue so they do not have to wait for the reaper.
    let seeded = store
        .scan_stale_pending(Utc::now(), cfg.queue_capacity as i64)
        .await
        .context("scan pending backlog")?;
    let backlog = seeded.len();
    for id in seeded {
        if !queue.offer(id) {
            break;
        }
    }
    if backlog > 0 {
        tracing::info!(event = "tally.server.backlog_seeded", jobs = backlog, "pending backlog re-enqueued");
    }

    let service = Arc::new(JobService::new(
        store.clone(),
        queue.clone(),
        cfg.max_text_bytes,
    ));

    let bind: SocketAddr = cfg
        .http_bind
        .parse()
        .with_context(|| format!("parse HTTP_BIND={}", cfg.http_bind))?;
    let server = ApiServer::start(service, bind).await?;
    let supervisor = Supervisor::start(&cfg, store, queue);

    Ok((server, supervisor))
}
