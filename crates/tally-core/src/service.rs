//! The core façade the submission adapter calls.

use std::sync::Arc;

use chrono::Utc;

use crate::error::{CoreError, Result};
use crate::job::{JobId, JobOutcome, JobStatus, JobView};
use crate::queue::JobQueue;
use crate::store::JobStore;

pub struct JobService {
    store: Arc<JobStore>,
    queue: Arc<JobQueue>,
    max_text_bytes: usize,
}

impl JobService {
    pub fn new(store: Arc<JobStore>, queue: Arc<JobQueue>, max_text_bytes: usize) -> Self {
        Self {
            store,
            queue,
            max_text_bytes,
        }
    }

    pub fn max_text_bytes(&self) -> usize {
        self.max_text_bytes
    }

    /// Validate, persist, and enqueue a new job. The insert is what makes the
    /// job exist; the queue offer is only a hint, and a full queue is not an
    /// error (the reaper restores coverage).
    pub async fn submit(&self, text: String) -> Result<JobId> {
        if text.len() > self.max_text_bytes {
            return Err(CoreError::InvalidInput(format!(
                "text is {} bytes, limit is {}",
                text.len(),
                self.max_text_bytes
            )));
        }

        let id = JobId::generate();
        self.store.insert(id, &text, Utc::now()).await?;

        if !self.queue.offer(id) {
            tracing::debug!(
                event = "tally.submit.queue_full",
                job_id = %id,
                "queue full, enqueue left to the reaper"
            );
        }

        tracing::info!(
            event = "tally.submit.accepted",
            job_id = %id,
            bytes = text.len(),
            "job submitted"
        );
        Ok(id)
    }

    pub async fn status_of(&self, id: JobId) -> Result<JobView> {
        self.store.get_view(id).await
    }

    pub async fn result_of(&self, id: JobId) -> Result<JobOutcome> {
        let view = self.store.get_view(id).await?;
        Ok(match view.status {
            JobStatus::Done => JobOutcome::Done {
                chars: view.result_chars.unwrap_or_default(),
            },
            JobStatus::Failed => JobOutcome::Failed {
                attempts: view.attempts,
                error: view.last_error.unwrap_or_default(),
            },
            status => JobOutcome::InProgress { status },
        })
    }
}
