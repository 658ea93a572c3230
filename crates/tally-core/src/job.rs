//! The job data model shared by the store, the workers, and the HTTP adapter.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Opaque 128-bit job identifier, rendered as 32 lowercase hex characters.
///
/// Generated at submit time; clients treat it as an opaque token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

#[derive(Debug, Error)]
#[error("malformed job id")]
pub struct MalformedJobId;

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for JobId {
    type Err = MalformedJobId;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // Only the 32-char simple form is accepted; hyphenated uuids are not
        // part of the public id space.
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(MalformedJobId);
        }
        Uuid::try_parse(s).map(Self).map_err(|_| MalformedJobId)
    }
}

impl Serialize for JobId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for JobId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Job lifecycle state. `Done` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Started,
    Processing,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Started => "started",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read-only snapshot of a job's user-visible attributes.
///
/// Excludes `text`; the worker fetches that separately once it holds the
/// lease.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: JobId,
    pub status: JobStatus,
    pub result_chars: Option<i64>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub processing_by: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Client-facing outcome of a result lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Done { chars: i64 },
    InProgress { status: JobStatus },
    Failed { attempts: i64, error: String },
}
