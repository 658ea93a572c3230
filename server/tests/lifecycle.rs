use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use sqlx::Row;
use tally_core::{JobId, JobQueue, JobService, JobStore};
use tally_server::api::ApiServer;
use tally_server::config::ServerConfig;
use tally_server::serve;
use tally_server::supervisor::Supervisor;
use tempfile::TempDir;

/// Fast-cycle defaults for tests; individual tests override knobs on top.
fn test_config(dir: &TempDir) -> ServerConfig {
    let db_url = format!("sqlite://{}", dir.path().join("tally.db").display());
    ServerConfig::parse_from([
        "tally-server",
        "--database-url",
        db_url.as_str(),
        "--http-bind",
        "127.0.0.1:0",
        "--worker-count",
        "2",
        "--work-delay-ms",
        "25",
        "--lease-seconds",
        "2",
        "--reaper-interval-seconds",
        "1",
        "--restart-backoff-ms",
        "50",
        "--shutdown-grace-seconds",
        "5",
    ])
}

struct TestStack {
    base_url: String,
    client: reqwest::Client,
    store: JobStore,
    server: ApiServer,
    supervisor: Supervisor,
    _dir: TempDir,
}

impl TestStack {
    async fn start(cfg: ServerConfig, dir: TempDir) -> anyhow::Result<Self> {
        let store = JobStore::connect(&cfg.database_url, 2)
            .await
            .context("open audit store handle")?;
        store.migrate().await.context("migrate test store")?;

        let (server, supervisor) = serve::start(cfg).await.context("start test stack")?;
        Ok(Self {
            base_url: format!("http://{}", server.addr),
            client: reqwest::Client::new(),
            store,
            server,
            supervisor,
            _dir: dir,
        })
    }

    async fn stop(self) -> anyhow::Result<()> {
        self.server.shutdown().await?;
        self.supervisor.shutdown().await?;
        Ok(())
    }

    async fn submit(&self, bytes: Vec<u8>) -> anyhow::Result<reqwest::Response> {
        let form = Form::new().part("file", Part::bytes(bytes).file_name("input.txt"));
        Ok(self
            .client
            .post(format!("{}/jobs", self.base_url))
            .multipart(form)
            .send()
            .await?)
    }

    async fn submit_ok(&self, text: &str) -> anyhow::Result<String> {
        let resp = self.submit(text.as_bytes().to_vec()).await?;
        anyhow::ensure!(
            resp.status() == StatusCode::CREATED,
            "submit returned {}",
            resp.status()
        );
        let body: serde_json::Value = resp.json().await?;
        anyhow::ensure!(body["status"] == "pending", "fresh job must be pending");
        body["job_id"]
            .as_str()
            .map(str::to_string)
            .context("submit response has no job_id")
    }

    async fn result(&self, id: &str) -> anyhow::Result<reqwest::Response> {
        Ok(self
            .client
            .get(format!("{}/jobs/{id}/result", self.base_url))
            .send()
            .await?)
    }

    async fn status(&self, id: &str) -> anyhow::Result<reqwest::Response> {
        Ok(self
            .client
            .get(format!("{}/jobs/{id}/status", self.base_url))
            .send()
            .await?)
    }

    /// Poll the result endpoint until the job is terminal (200 or 409).
    async fn wait_for_terminal(
        &self,
        id: &str,
        timeout: Duration,
    ) -> anyhow::Result<(StatusCode, serde_json::Value)> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let resp = self.result(id).await?;
            let status = resp.status();
            if status == StatusCode::OK || status == StatusCode::CONFLICT {
                return Ok((status, resp.json().await?));
            }
            anyhow::ensure!(
                tokio::time::Instant::now() < deadline,
                "job {id} did not reach a terminal state in time"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn row_count(&self) -> anyhow::Result<i64> {
        Ok(self.store.count().await?)
    }
}

/// Audit the store-visible invariants over every row: done rows carry the
/// code-point count of their text, leases exist exactly for started and
/// processing rows, failed rows reached the retry cap with an error recorded,
/// and timestamps never run backwards.
async fn audit_invariants(store: &JobStore, max_retries: i64) -> anyhow::Result<()> {
    let rows = sqlx::query(
        "SELECT id, status, text, result_chars, attempts, last_error, \
         processing_by, lease_until, created_at, updated_at FROM jobs",
    )
    .fetch_all(store.pool())
    .await?;

    for row in rows {
        let id: String = row.try_get("id")?;
        let status: String = row.try_get("status")?;
        let text: String = row.try_get("text")?;
        let result_chars: Option<i64> = row.try_get("result_chars")?;
        let attempts: i64 = row.try_get("attempts")?;
        let last_error: Option<String> = row.try_get("last_error")?;
        let processing_by: Option<String> = row.try_get("processing_by")?;
        let lease_until: Option<chrono::DateTime<Utc>> = row.try_get("lease_until")?;
        let created_at: chrono::DateTime<Utc> = row.try_get("created_at")?;
        let updated_at: chrono::DateTime<Utc> = row.try_get("updated_at")?;

        anyhow::ensure!(attempts >= 0, "job {id}: negative attempts");
        anyhow::ensure!(created_at <= updated_at, "job {id}: created_at after updated_at");

        match status.as_str() {
            "done" => anyhow::ensure!(
                result_chars == Some(text.chars().count() as i64),
                "job {id}: done without the correct character count"
            ),
            "started" | "processing" => anyhow::ensure!(
                processing_by.is_some() && lease_until.is_some(),
                "job {id}: {status} without an owner and lease"
            ),
            "pending" => anyhow::ensure!(
                processing_by.is_none() && lease_until.is_none(),
                "job {id}: pending with leftover lease fields"
            ),
            "failed" => anyhow::ensure!(
                attempts >= max_retries && last_error.is_some(),
                "job {id}: failed below the retry cap or without an error"
            ),
            other => anyhow::bail!("job {id}: unknown status {other}"),
        }
    }
    Ok(())
}

#[tokio::test]
async fn happy_path_submit_and_poll_result() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = test_config(&dir);
    let stack = TestStack::start(cfg, dir).await?;

    let id = stack.submit_ok("hello").await?;
    let (code, body) = stack.wait_for_terminal(&id, Duration::from_secs(10)).await?;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["status"], "done");
    assert_eq!(body["characters"], 5);

    let status_body: serde_json::Value = stack.status(&id).await?.json().await?;
    assert_eq!(status_body["status"], "done");
    assert_eq!(status_body["job_id"], id.as_str());

    audit_invariants(&stack.store, 3).await?;
    stack.stop().await
}

#[tokio::test]
async fn characters_are_unicode_code_points() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = test_config(&dir);
    let stack = TestStack::start(cfg, dir).await?;

    let id = stack.submit_ok("héllo🌍").await?;
    let (code, body) = stack.wait_for_terminal(&id, Duration::from_secs(10)).await?;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["characters"], 6, "code points, not bytes or graphemes");

    stack.stop().await
}

#[tokio::test]
async fn result_is_not_ready_before_completion() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = test_config(&dir);
    cfg.work_delay_ms = 2_000;
    let stack = TestStack::start(cfg, dir).await?;

    let id = stack.submit_ok("slow job").await?;
    let resp = stack.result(&id).await?;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = resp.json().await?;
    assert_eq!(body["detail"], "Result not ready");

    let (code, body) = stack.wait_for_terminal(&id, Duration::from_secs(15)).await?;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["characters"], 8);

    stack.stop().await
}

#[tokio::test]
async fn transient_faults_retry_until_success() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = test_config(&dir);
    cfg.fault_rate = 0.5;
    cfg.max_retries = 10;
    let max_retries = cfg.max_retries;
    let stack = TestStack::start(cfg, dir).await?;

    let id = stack.submit_ok("retry me").await?;
    let (code, body) = stack.wait_for_terminal(&id, Duration::from_secs(30)).await?;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["characters"], 8);

    let status_body: serde_json::Value = stack.status(&id).await?.json().await?;
    let attempts = status_body["attempts"].as_i64().context("attempts field")?;
    assert!(
        (0..max_retries).contains(&attempts),
        "attempts {attempts} out of range"
    );

    audit_invariants(&stack.store, max_retries).await?;
    stack.stop().await
}

#[tokio::test]
async fn exhausted_retries_fail_permanently() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = test_config(&dir);
    cfg.fault_rate = 1.0;
    cfg.max_retries = 2;
    let stack = TestStack::start(cfg, dir).await?;

    let id = stack.submit_ok("doomed").await?;
    let (code, body) = stack.wait_for_terminal(&id, Duration::from_secs(15)).await?;
    assert_eq!(code, StatusCode::CONFLICT);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["attempts"], 2, "failure does not add an attempt");
    assert!(
        body["error"].as_str().is_some_and(|e| !e.is_empty()),
        "failed jobs carry their last error"
    );

    audit_invariants(&stack.store, 2).await?;
    stack.stop().await
}

#[tokio::test]
async fn abandoned_lease_is_reaped_and_completed() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = test_config(&dir);

    // A worker crashed mid-processing before this process started: the row
    // sits in processing with an expired lease and no queue hint anywhere.
    let store = JobStore::connect(&cfg.database_url, 2).await?;
    store.migrate().await?;
    let id = JobId::generate();
    let now = Utc::now();
    store.insert(id, "crashy", now).await?;
    assert!(
        store
            .claim(id, "w-crashed", now - chrono::Duration::seconds(5), now)
            .await?
    );
    assert!(store.mark_processing(id, now).await?);

    let stack = TestStack::start(cfg, dir).await?;
    let (code, body) = stack
        .wait_for_terminal(&id.to_string(), Duration::from_secs(15))
        .await?;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["characters"], 6);

    audit_invariants(&stack.store, 3).await?;
    stack.stop().await
}

#[tokio::test]
async fn pending_backlog_is_recovered_on_boot() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = test_config(&dir);

    // Jobs submitted by another process (e.g. the submit subcommand): rows
    // exist, but no hint ever reaches this server's queue.
    let store = std::sync::Arc::new(JobStore::connect(&cfg.database_url, 2).await?);
    store.migrate().await?;
    let service = JobService::new(
        store.clone(),
        std::sync::Arc::new(JobQueue::new(1)),
        cfg.max_text_bytes,
    );
    let mut ids = Vec::new();
    for text in ["one", "two", "three"] {
        ids.push(service.submit(text.to_string()).await?);
    }

    let stack = TestStack::start(cfg, dir).await?;
    for id in &ids {
        let (code, _) = stack
            .wait_for_terminal(&id.to_string(), Duration::from_secs(15))
            .await?;
        assert_eq!(code, StatusCode::OK);
    }

    stack.stop().await
}

#[tokio::test]
async fn unknown_and_malformed_ids_are_not_found() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = test_config(&dir);
    let stack = TestStack::start(cfg, dir).await?;

    let zero = "00000000000000000000000000000000";
    assert_eq!(stack.result(zero).await?.status(), StatusCode::NOT_FOUND);
    assert_eq!(stack.status(zero).await?.status(), StatusCode::NOT_FOUND);

    assert_eq!(
        stack.result("not-a-job-id").await?.status(),
        StatusCode::NOT_FOUND
    );

    stack.stop().await
}

#[tokio::test]
async fn oversized_upload_is_rejected_without_a_row() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = test_config(&dir);
    let stack = TestStack::start(cfg, dir).await?;

    assert_eq!(stack.row_count().await?, 0);
    let resp = stack.submit(vec![b'a'; 2 * 1024 * 1024]).await?;
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(stack.row_count().await?, 0, "rejected submits leave no row");

    stack.stop().await
}

#[tokio::test]
async fn non_utf8_upload_is_rejected_without_a_row() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = test_config(&dir);
    let stack = TestStack::start(cfg, dir).await?;

    let resp = stack.submit(vec![0xff, 0xfe, 0x00, 0x01]).await?;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(stack.row_count().await?, 0);

    stack.stop().await
}

#[tokio::test]
async fn healthz_is_live() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let cfg = test_config(&dir);
    let stack = TestStack::start(cfg, dir).await?;

    let resp = stack
        .client
        .get(format!("{}/healthz", stack.base_url))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);

    stack.stop().await
}

#[tokio::test]
async fn randomized_workload_reaches_terminal_states() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut cfg = test_config(&dir);
    cfg.fault_rate = 0.3;
    cfg.max_retries = 8;
    cfg.worker_count = 3;
    let max_retries = cfg.max_retries;
    let stack = TestStack::start(cfg, dir).await?;

    let texts = [
        "a", "ab", "abc", "héllo🌍", "retry me", "", "space separated words",
        "tabs\tand\nnewlines", "longer text with some more characters in it",
        "0123456789", "ααβγδ", "🌍🌍🌍",
    ];
    let mut expected = Vec::new();
    for text in texts {
        let id = stack.submit_ok(text).await?;
        expected.push((id, text.chars().count() as i64));
    }

    for (id, chars) in &expected {
        let (code, body) = stack.wait_for_terminal(id, Duration::from_secs(60)).await?;
        // With a 0.3 fault rate and a cap of 8, permanent failure is all but
        // impossible; every job is expected to land on done.
        assert_eq!(code, StatusCode::OK, "job {id} failed: {body}");
        assert_eq!(body["characters"], *chars, "job {id} miscounted");
    }

    audit_invariants(&stack.store, max_retries).await?;
    stack.stop().await
}
