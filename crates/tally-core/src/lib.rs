//! Durable execution core for the Tally job queue.
//!
//! This crate owns the pieces whose correctness the service depends on: the
//! job data model, the SQLite-backed store with atomic lifecycle transitions,
//! the in-memory hint queue, and the submission façade. Process wiring
//! (workers, reaper, supervisor, HTTP) lives in the `tally-server` crate.

pub mod error;
pub mod job;
pub mod queue;
pub mod service;
pub mod store;

pub use error::{CoreError, Result};
pub use job::{JobId, JobOutcome, JobStatus, JobView};
pub use queue::JobQueue;
pub use service::JobService;
pub use store::JobStore;
