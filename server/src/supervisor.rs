//! Task supervision: launch the worker pool and the reaper, restart abnormal
//! exits, and coordinate graceful shutdown.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tally_core::{JobQueue, JobStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::{reaper, worker};

pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl Supervisor {
    /// Launch `WORKER_COUNT` workers (labels `w-1`..) and the reaper, each
    /// under a supervising loop.
    pub fn start(cfg: &ServerConfig, store: Arc<JobStore>, queue: Arc<JobQueue>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let backoff = cfg.restart_backoff();
        let mut tasks = Vec::with_capacity(cfg.worker_count + 1);

        for n in 1..=cfg.worker_count {
            let label = format!("w-{n}");
            let cfg = cfg.clone();
            let store = store.clone();
            let queue = queue.clone();
            let shutdown_rx = shutdown_rx.clone();
            let task_label = label.clone();
            tasks.push(tokio::spawn(supervise(
                label,
                backoff,
                shutdown_rx.clone(),
                move || {
                    worker::run(
                        task_label.clone(),
                        cfg.clone(),
                        store.clone(),
                        queue.clone(),
                        shutdown_rx.clone(),
                    )
                },
            )));
        }

        {
            let cfg = cfg.clone();
            let shutdown_rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(supervise(
                "reaper".to_string(),
                backoff,
                shutdown_rx.clone(),
                move || {
                    reaper::run(
                        cfg.clone(),
                        store.clone(),
                        queue.clone(),
                        shutdown_rx.clone(),
                    )
                },
            )));
        }

        Self {
            shutdown_tx,
            tasks,
            grace: cfg.shutdown_grace(),
        }
    }

    /// Signal every task, then wait up to the grace period for in-flight work
    /// to drain. Leases left behind after a hard cutoff are recovered by the
    /// reaper on next boot.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);

        let drain = async {
            for task in self.tasks {
                let _ = task.await;
            }
        };

        if tokio::time::timeout(self.grace, drain).await.is_err() {
            tracing::warn!(
                event = "tally.supervisor.drain_timeout",
                "shutdown grace elapsed, abandoning in-flight tasks"
            );
        }
        Ok(())
    }
}

/// Run `task` until it exits gracefully or shutdown is signalled. An `Err`
/// return or a panic is logged and the task is relaunched under the same
/// label after the backoff.
async fn supervise<F, Fut>(
    label: String,
    backoff: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    mut task: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    loop {
        // Spawned so a panic surfaces as a JoinError instead of unwinding
        // through the supervisor.
        match tokio::spawn(task()).await {
            Ok(Ok(())) => break,
            Ok(Err(err)) => {
                tracing::error!(
                    event = "tally.supervisor.task_failed",
                    task = %label,
                    error = %format!("{err:#}"),
                    "task exited abnormally"
                );
            }
            Err(join_err) => {
                tracing::error!(
                    event = "tally.supervisor.task_panicked",
                    task = %label,
                    error = %join_err,
                    "task panicked"
                );
            }
        }

        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.changed() => break,
        }

        tracing::info!(event = "tally.supervisor.task_restarted", task = %label, "restarting task");
    }
}
