use crate::job::JobId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors surfaced by the durable core.
///
/// Worker-side transform failures are not represented here: the worker loop
/// converts them into retry/failure accounting and they never propagate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Submit-time validation failure. Never stored.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Unknown job id.
    #[error("job {0} not found")]
    NotFound(JobId),

    /// Primary-key collision on insert. Ids are random 128-bit values, so
    /// this is never expected in practice.
    #[error("job {0} already exists")]
    AlreadyExists(JobId),

    /// The persistent store is unreachable or refused the transaction.
    #[error("store unavailable: {0}")]
    Store(#[from] sqlx::Error),

    #[error("store migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}
