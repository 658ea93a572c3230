//! Worker loop: pull a hint, claim under a lease, transform, finalize.
//!
//! Every transform error is converted into retry/failure accounting inside
//! the loop; the loop itself only returns on shutdown. A panic is a crash,
//! which is the supervisor's and the reaper's problem, not the store's.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use rand::Rng;
use tally_core::{JobId, JobQueue, JobStore};
use tokio::sync::watch;

use crate::config::ServerConfig;

pub async fn run(
    label: String,
    cfg: ServerConfig,
    store: Arc<JobStore>,
    queue: Arc<JobQueue>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(event = "tally.worker.started", worker = %label, "worker started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let id = tokio::select! {
            _ = shutdown_rx.changed() => break,
            id = queue.take() => match id {
                Some(id) => id,
                None => break,
            },
        };

        process_one(&label, &cfg, &store, &queue, id).await;
    }

    tracing::info!(event = "tally.worker.stopped", worker = %label, "worker stopped");
    Ok(())
}

async fn process_one(
    label: &str,
    cfg: &ServerConfig,
    store: &JobStore,
    queue: &JobQueue,
    id: JobId,
) {
    let now = Utc::now();
    let lease_until = now + cfg.lease();

    match store.claim(id, label, lease_until, now).await {
        Ok(true) => {}
        Ok(false) => {
            // Someone else owns it, it is terminal, or the reaper is cycling
            // it. The hint is simply dropped.
            tracing::debug!(
                event = "tally.worker.claim_refused",
                worker = %label,
                job_id = %id,
                "claim refused, dropping hint"
            );
            return;
        }
        Err(err) => {
            // No state changed; the job stays pending and the reaper will
            // re-offer it.
            tracing::warn!(
                event = "tally.worker.claim_error",
                worker = %label,
                job_id = %id,
                error = %err,
                "claim failed against the store"
            );
            return;
        }
    }

    if let Err(err) = execute(label, cfg, store, id).await {
        account_failure(label, cfg, store, queue, id, err).await;
    }
}

/// Steps after a successful claim. Any `Err` is a failed attempt to account;
/// a refused completion is a lost race, not a failure.
async fn execute(
    label: &str,
    cfg: &ServerConfig,
    store: &JobStore,
    id: JobId,
) -> anyhow::Result<()> {
    let now = Utc::now();
    if !store.mark_processing(id, now).await? {
        anyhow::bail!("job left started state before processing began");
    }

    let text = store.fetch_text(id).await.context("fetch job text")?;

    if cfg.fault_rate > 0.0 && rand::thread_rng().gen::<f64>() < cfg.fault_rate {
        anyhow::bail!("injected transform fault");
    }

    let chars = text.chars().count() as i64;

    let delay = cfg.work_delay();
    if !delay.is_zero() {
        // If the simulated work eats most of the lease window, push the
        // deadline out before sleeping so the reaper does not race us.
        if cfg.work_delay_ms >= cfg.lease_seconds.saturating_mul(1000) / 2 {
            let now = Utc::now();
            let extended = now + cfg.lease() + chrono::Duration::milliseconds(cfg.work_delay_ms as i64);
            store.extend_lease(id, extended, now).await?;
        }
        tokio::time::sleep(delay).await;
    }

    let now = Utc::now();
    if store.complete(id, chars, now).await? {
        tracing::info!(
            event = "tally.worker.completed",
            worker = %label,
            job_id = %id,
            chars,
            "job completed"
        );
    } else {
        // The lease expired mid-transform and the job moved on without us.
        // The transform is idempotent, so whoever finishes it records the
        // same result; duplicate work is not an error.
        tracing::debug!(
            event = "tally.worker.completion_refused",
            worker = %label,
            job_id = %id,
            "completion refused, lease was lost"
        );
    }
    Ok(())
}

/// Convert a caught transform error into retry or permanent failure. The
/// retry bump always lands first; when it pushes the count to the cap the
/// terminal transition follows immediately.
async fn account_failure(
    label: &str,
    cfg: &ServerConfig,
    store: &JobStore,
    queue: &JobQueue,
    id: JobId,
    err: anyhow::Error,
) {
    let reason = format!("{err:#}");
    tracing::warn!(
        event = "tally.worker.attempt_failed",
        worker = %label,
        job_id = %id,
        error = %reason,
        "attempt failed"
    );

    let attempts = match store.get_view(id).await {
        Ok(view) => view.attempts,
        Err(view_err) => {
            tracing::error!(
                event = "tally.worker.accounting_error",
                worker = %label,
                job_id = %id,
                error = %view_err,
                "could not read attempts, leaving the job to the reaper"
            );
            return;
        }
    };

    let now = Utc::now();
    match store.record_retry(id, &reason, now).await {
        Ok(true) => {}
        Ok(false) => return, // terminal or raced away; nothing to account
        Err(retry_err) => {
            tracing::error!(
                event = "tally.worker.accounting_error",
                worker = %label,
                job_id = %id,
                error = %retry_err,
                "could not record retry, leaving the job to the reaper"
            );
            return;
        }
    }

    let new_attempts = attempts + 1;
    if new_attempts < cfg.max_retries {
        if !queue.offer(id) {
            tracing::debug!(
                event = "tally.worker.requeue_dropped",
                worker = %label,
                job_id = %id,
                "queue full, reaper will re-enqueue"
            );
        }
        return;
    }

    match store.record_failed(id, &reason, now).await {
        Ok(true) => {
            tracing::warn!(
                event = "tally.worker.failed_permanently",
                worker = %label,
                job_id = %id,
                attempts = new_attempts,
                "retry cap reached, job failed"
            );
        }
        Ok(false) => {}
        Err(fail_err) => {
            tracing::error!(
                event = "tally.worker.accounting_error",
                worker = %label,
                job_id = %id,
                error = %fail_err,
                "could not record failure, job stays pending at the cap"
            );
        }
    }
}
