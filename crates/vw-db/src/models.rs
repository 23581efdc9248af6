//! Rust structs mapping to database tables.

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vw_core::JobId;

/// Job lifecycle states.
///
/// Transitions are monotonic: `queued -> running -> {done, error}`, with
/// two exceptions: the stale-recovery sweep may force `running -> queued`,
/// and a queued job may be flipped to `canceled` as bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
    Canceled,
}

impl JobStatus {
    /// Stable string form stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
            JobStatus::Canceled => "canceled",
        }
    }

    fn from_column(s: &str, idx: usize) -> rusqlite::Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "error" => Ok(JobStatus::Error),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(rusqlite::Error::FromSqlConversionFailure(
                idx,
                rusqlite::types::Type::Text,
                format!("unknown job status: {other}").into(),
            )),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted unit of deferred work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// String tag selecting a handler; opaque to the store.
    pub kind: String,
    pub status: JobStatus,
    /// Higher priority is served first.
    pub priority: i64,
    /// Opaque structured data, interpreted only by the handler.
    pub payload: serde_json::Value,
    /// Set only on terminal failure.
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl Job {
    /// Construct a `Job` from a row selected with [`crate::queries::jobs::COLS`].
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let id: String = row.get(0)?;
        let id = Uuid::parse_str(&id)
            .map(JobId::from)
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?;

        let status: String = row.get(2)?;
        let payload_json: String = row.get(4)?;

        Ok(Self {
            id,
            kind: row.get(1)?,
            status: JobStatus::from_column(&status, 2)?,
            priority: row.get(3)?,
            payload: serde_json::from_str(&payload_json)
                .unwrap_or(serde_json::Value::Object(Default::default())),
            error: row.get(5)?,
            created_at: row.get(6)?,
            started_at: row.get(7)?,
            finished_at: row.get(8)?,
        })
    }

    /// The retry counter carried in the payload (0 for a first attempt).
    pub fn retry_count(&self) -> u32 {
        self.payload
            .get("retry_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32
    }
}
