//! Lease recovery loop.
//!
//! The only mechanism that recovers jobs abandoned by crashed workers or by
//! transforms that outlived their lease. Deliberately separate from the
//! worker code path so worker bugs cannot suppress recovery. It also rebuilds
//! queue coverage: pending rows whose hint was dropped (full queue, process
//! restart) are re-offered once they have sat untouched for a lease window.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tally_core::{JobQueue, JobStore};
use tokio::sync::watch;

use crate::config::ServerConfig;

pub async fn run(
    cfg: ServerConfig,
    store: Arc<JobStore>,
    queue: Arc<JobQueue>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(
        event = "tally.reaper.started",
        interval_secs = cfg.reaper_interval_seconds,
        batch = cfg.reaper_batch,
        "reaper started"
    );

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        if let Err(err) = tick(&cfg, &store, &queue).await {
            tracing::warn!(event = "tally.reaper.tick_error", error = %format!("{err:#}"), "reaper tick failed");
        }

        tokio::select! {
            _ = tokio::time::sleep(cfg.reaper_interval()) => {}
            _ = shutdown_rx.changed() => {}
        }
    }

    tracing::info!(event = "tally.reaper.stopped", "reaper stopped");
    Ok(())
}

async fn tick(cfg: &ServerConfig, store: &JobStore, queue: &JobQueue) -> anyhow::Result<()> {
    let now = Utc::now();

    let expired = store
        .scan_expired_leases(now, cfg.reaper_batch)
        .await
        .context("scan expired leases")?;

    for id in expired {
        // Conditional reset: a worker that extended its lease or completed in
        // the meantime wins the race and the reset is a no-op.
        if store.reset_expired(id, now).await.context("reset expired lease")? {
            tracing::info!(
                event = "tally.reaper.lease_reclaimed",
                job_id = %id,
                "expired lease reclaimed"
            );
            if !queue.offer(id) {
                tracing::debug!(
                    event = "tally.reaper.enqueue_dropped",
                    job_id = %id,
                    "queue full, will retry next tick"
                );
            }
        }
    }

    let stale_cutoff = now - cfg.lease();
    let stale = store
        .scan_stale_pending(stale_cutoff, cfg.reaper_batch)
        .await
        .context("scan stale pending")?;

    for id in stale {
        if !queue.offer(id) {
            // Queue is full; the rest of the batch would not fit either.
            break;
        }
        tracing::debug!(
            event = "tally.reaper.coverage_restored",
            job_id = %id,
            "stale pending job re-enqueued"
        );
    }

    Ok(())
}
