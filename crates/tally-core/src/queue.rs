//! Bounded in-memory FIFO of pending job ids.
//!
//! The queue is a scheduling hint, not a source of truth: the store is
//! authoritative, and the reaper restores enqueue coverage for any id the
//! queue drops or loses. Nothing here persists across restarts.

use crate::job::JobId;
use tokio::sync::{mpsc, Mutex};

pub struct JobQueue {
    tx: mpsc::Sender<JobId>,
    rx: Mutex<mpsc::Receiver<JobId>>,
    capacity: usize,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Non-blocking enqueue. Returns false when the queue is full; the caller
    /// must not treat that as a failure; the reaper re-offers the id later.
    pub fn offer(&self, id: JobId) -> bool {
        self.tx.try_send(id).is_ok()
    }

    /// Await the next id. Cancel-safe: callers select this against a shutdown
    /// signal, and a cancelled take neither loses a message nor wedges the
    /// receiver lock.
    pub async fn take(&self) -> Option<JobId> {
        self.rx.lock().await.recv().await
    }
}
