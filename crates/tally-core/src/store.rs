//! The persistent job store.
//!
//! One SQLite database with a single `jobs` table holds the authoritative
//! lifecycle state. Every transition is a short atomic statement; conditional
//! transitions (claim, complete, reset) are single `UPDATE ... WHERE`
//! statements so the predicate is evaluated inside the storage engine and two
//! racing callers resolve to exactly one winner via `rows_affected`.
//!
//! The database is opened in WAL journal mode: many concurrent readers, one
//! serialized writer, which is the concurrency model the core relies on.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;

use crate::error::{CoreError, Result};
use crate::job::{JobId, JobView};

#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (creating if missing) the database at `url` with a small bounded
    /// pool. WAL mode keeps readers unblocked by the writer; the busy timeout
    /// absorbs writer contention instead of surfacing SQLITE_BUSY.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Create a pending row. Ids are random 128-bit values, so a collision
    /// surfaces as `AlreadyExists` rather than being silently absorbed.
    pub async fn insert(&self, id: JobId, text: &str, now: DateTime<Utc>) -> Result<()> {
        let res = sqlx::query(
            r#"
            INSERT INTO jobs (id, status, text, attempts, created_at, updated_at)
            VALUES (?, 'pending', ?, 0, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(text)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(CoreError::AlreadyExists(id))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The sole primitive that grants exclusive execution rights. Succeeds
    /// only against a pending row whose lease (if any) has expired; the
    /// predicate runs inside the engine, so concurrent claims on one id
    /// resolve to exactly one winner.
    pub async fn claim(
        &self,
        id: JobId,
        worker_label: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'started',
                processing_by = ?,
                lease_until = ?,
                updated_at = ?
            WHERE id = ?
              AND status = 'pending'
              AND (lease_until IS NULL OR lease_until < ?)
            "#,
        )
        .bind(worker_label)
        .bind(lease_until)
        .bind(now)
        .bind(id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// started -> processing. False when the claim was lost in the meantime.
    pub async fn mark_processing(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'processing', updated_at = ?
            WHERE id = ? AND status = 'started'
            "#,
        )
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// Push the lease deadline out without changing status. Workers call this
    /// when the transform outlives the initial lease window.
    pub async fn extend_lease(
        &self,
        id: JobId,
        new_lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET lease_until = ?, updated_at = ?
            WHERE id = ? AND status IN ('started', 'processing')
            "#,
        )
        .bind(new_lease_until)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// Terminal success: records the character count and releases the lease.
    pub async fn complete(
        &self,
        id: JobId,
        result_chars: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'done',
                result_chars = ?,
                processing_by = NULL,
                lease_until = NULL,
                updated_at = ?
            WHERE id = ? AND status IN ('started', 'processing')
            "#,
        )
        .bind(result_chars)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// Failed attempt accounting: bumps `attempts`, records the error, and
    /// returns the job to pending with the lease cleared. Attempts are only
    /// ever incremented here, which keeps them monotonic.
    pub async fn record_retry(&self, id: JobId, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                attempts = attempts + 1,
                last_error = ?,
                processing_by = NULL,
                lease_until = NULL,
                updated_at = ?
            WHERE id = ? AND status NOT IN ('done', 'failed')
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// Terminal failure. Does not touch `attempts`: the attempt that hit the
    /// cap was already counted by the `record_retry` that preceded this call.
    pub async fn record_failed(&self, id: JobId, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                last_error = ?,
                processing_by = NULL,
                lease_until = NULL,
                updated_at = ?
            WHERE id = ? AND status NOT IN ('done', 'failed')
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    pub async fn fetch_text(&self, id: JobId) -> Result<String> {
        let row = sqlx::query("SELECT text FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(row.try_get("text")?),
            None => Err(CoreError::NotFound(id)),
        }
    }

    pub async fn get_view(&self, id: JobId) -> Result<JobView> {
        let row = sqlx::query(
            r#"
            SELECT id, status, result_chars, attempts, last_error,
                   processing_by, lease_until, created_at, updated_at
            FROM jobs
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => view_from_row(&row),
            None => Err(CoreError::NotFound(id)),
        }
    }

    /// Ids whose lease has expired, oldest deadline first. Feeds the reaper.
    pub async fn scan_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<JobId>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE status IN ('started', 'processing')
              AND lease_until IS NOT NULL
              AND lease_until < ?
            ORDER BY lease_until
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| id_from_row(row)).collect()
    }

    /// Conditional counterpart of `scan_expired_leases`: the expiry predicate
    /// is re-checked so a reset races cleanly against a worker that extended
    /// its lease or completed in the meantime.
    pub async fn reset_expired(&self, id: JobId, now: DateTime<Utc>) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                processing_by = NULL,
                lease_until = NULL,
                updated_at = ?
            WHERE id = ?
              AND status IN ('started', 'processing')
              AND lease_until IS NOT NULL
              AND lease_until < ?
            "#,
        )
        .bind(now)
        .bind(id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    /// Pending ids not touched since `cutoff`, oldest first. The reaper uses
    /// this to rebuild queue coverage for hints dropped by a full queue or a
    /// restart; passing `now` as the cutoff returns every pending id.
    pub async fn scan_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<JobId>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM jobs
            WHERE status = 'pending' AND updated_at < ?
            ORDER BY updated_at
            LIMIT ?
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| id_from_row(row)).collect()
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

fn id_from_row(row: &SqliteRow) -> Result<JobId> {
    let raw: String = row.try_get("id")?;
    raw.parse().map_err(|err| {
        CoreError::Store(sqlx::Error::ColumnDecode {
            index: "id".into(),
            source: Box::new(err),
        })
    })
}

fn view_from_row(row: &SqliteRow) -> Result<JobView> {
    Ok(JobView {
        id: id_from_row(row)?,
        status: row.try_get("status")?,
        result_chars: row.try_get("result_chars")?,
        attempts: row.try_get("attempts")?,
        last_error: row.try_get("last_error")?,
        processing_by: row.try_get("processing_by")?,
        lease_until: row.try_get("lease_until")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
