//! Job queue operations.
//!
//! The claim order is deterministic and load-bearing for fairness:
//! priority descending, then submission time ascending (oldest first),
//! then id ascending as a total tie-break.

use chrono::{Duration, Utc};
use rusqlite::Connection;
use vw_core::{Error, JobId, Result};

use crate::models::{Job, JobStatus};

/// Column list matching [`Job::from_row`].
const COLS: &str = "id, kind, status, priority, payload, error, created_at, started_at, finished_at";

/// Enqueue a new job.
///
/// The payload shape is never validated; only the registered handler for
/// `kind` interprets it.
pub fn enqueue(
    conn: &Connection,
    kind: &str,
    payload: &serde_json::Value,
    priority: i64,
) -> Result<Job> {
    let id = JobId::new();
    let now = Utc::now().to_rfc3339();
    let payload_json =
        serde_json::to_string(payload).map_err(|e| Error::database(e.to_string()))?;

    conn.execute(
        "INSERT INTO jobs (id, kind, status, priority, payload, created_at)
         VALUES (?1, ?2, 'queued', ?3, ?4, ?5)",
        rusqlite::params![id.to_string(), kind, priority, payload_json, &now],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    Ok(Job {
        id,
        kind: kind.to_string(),
        status: JobStatus::Queued,
        priority,
        payload: payload.clone(),
        error: None,
        created_at: now,
        started_at: None,
        finished_at: None,
    })
}

/// Get a job by ID.
pub fn get_job(conn: &Connection, id: JobId) -> Result<Option<Job>> {
    let q = format!("SELECT {COLS} FROM jobs WHERE id = ?1");
    let result = conn.query_row(&q, [id.to_string()], Job::from_row);
    match result {
        Ok(j) => Ok(Some(j)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

/// List jobs with optional status filter, newest first.
pub fn list_jobs(
    conn: &Connection,
    status: Option<JobStatus>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Job>> {
    let (q, params_vec): (String, Vec<Box<dyn rusqlite::types::ToSql>>) = if let Some(s) = status {
        (
            format!(
                "SELECT {COLS} FROM jobs WHERE status = ?1
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
            ),
            vec![
                Box::new(s.as_str().to_string()),
                Box::new(limit),
                Box::new(offset),
            ],
        )
    } else {
        (
            format!("SELECT {COLS} FROM jobs ORDER BY created_at DESC LIMIT ?1 OFFSET ?2"),
            vec![Box::new(limit), Box::new(offset)],
        )
    };

    let mut stmt = conn
        .prepare(&q)
        .map_err(|e| Error::database(e.to_string()))?;
    let params_refs: Vec<&dyn rusqlite::types::ToSql> =
        params_vec.iter().map(|b| b.as_ref()).collect();
    let rows = stmt
        .query_map(params_refs.as_slice(), Job::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Count jobs in a given status.
pub fn count_by_status(conn: &Connection, status: JobStatus) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM jobs WHERE status = ?1",
        [status.as_str()],
        |row| row.get(0),
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Atomically claim the next eligible queued job.
///
/// Flips the selected row to `running` and stamps `started_at` in a
/// single `UPDATE ... RETURNING`, so no two claimers can receive the same
/// row. Selection order: priority DESC, created_at ASC, id ASC.
pub fn claim_next(conn: &Connection) -> Result<Option<Job>> {
    let now = Utc::now().to_rfc3339();

    // SQLite RETURNING is supported since 3.35.
    let q = format!(
        "UPDATE jobs SET status='running', started_at=?1
         WHERE id = (
             SELECT id FROM jobs WHERE status='queued'
             ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1
         )
         RETURNING {COLS}"
    );

    let result = conn.query_row(&q, rusqlite::params![&now], Job::from_row);
    match result {
        Ok(j) => Ok(Some(j)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(Error::database(e.to_string())),
    }
}

/// Refresh a running job's `started_at`.
///
/// The claim already stamped it; this is the explicit mutation the runner
/// performs once it commits to dispatching the job.
pub fn mark_running(conn: &Connection, id: JobId) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE jobs SET status='running', started_at=?1 WHERE id=?2",
            rusqlite::params![now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Mark a job done.
///
/// Note: the runner also marks a job done when it has been superseded by a
/// requeued retry, so `done` does not always mean the handler succeeded.
pub fn mark_done(conn: &Connection, id: JobId) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE jobs SET status='done', finished_at=?1 WHERE id=?2",
            rusqlite::params![now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Mark a job permanently failed.
pub fn mark_error(conn: &Connection, id: JobId, message: &str) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE jobs SET status='error', error=?1, finished_at=?2 WHERE id=?3",
            rusqlite::params![message, now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Cancel a queued job.
///
/// Bookkeeping only: jobs already `running` are not interrupted, so the
/// transition is refused (returns `false`) for any status other than
/// `queued`.
pub fn cancel(conn: &Connection, id: JobId) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let n = conn
        .execute(
            "UPDATE jobs SET status='canceled', finished_at=?1
             WHERE id=?2 AND status='queued'",
            rusqlite::params![now, id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Reset jobs stuck in `running` past the threshold back to `queued`.
///
/// This is the crash-recovery primitive: a process that died mid-job
/// leaves a `running` row behind, and the sweep makes it claimable again.
/// Returns how many jobs were recovered.
pub fn reset_stale_running(conn: &Connection, stale_after: Duration) -> Result<usize> {
    let cutoff = (Utc::now() - stale_after).to_rfc3339();

    // RFC3339 timestamps in UTC compare correctly as text.
    let n = conn
        .execute(
            "UPDATE jobs SET status='queued', started_at=NULL
             WHERE status='running' AND started_at < ?1",
            rusqlite::params![cutoff],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{get_conn, init_memory_pool};

    #[test]
    fn enqueue_and_get() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();

        let payload = serde_json::json!({"path": "/media/a.mkv"});
        let job = enqueue(&conn, "transcode", &payload, 5).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, 5);

        let fetched = get_job(&conn, job.id).unwrap().unwrap();
        assert_eq!(fetched.kind, "transcode");
        assert_eq!(fetched.payload, payload);
        assert!(fetched.error.is_none());
    }

    #[test]
    fn claim_order_is_priority_then_age() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();

        let payload = serde_json::json!({});
        let low_old = enqueue(&conn, "a", &payload, 0).unwrap();
        let high = enqueue(&conn, "b", &payload, 10).unwrap();
        let low_new = enqueue(&conn, "c", &payload, 0).unwrap();

        // Force distinct created_at ordering regardless of clock resolution.
        conn.execute(
            "UPDATE jobs SET created_at='2026-01-01T00:00:01+00:00' WHERE id=?1",
            [low_old.id.to_string()],
        )
        .unwrap();
        conn.execute(
            "UPDATE jobs SET created_at='2026-01-01T00:00:02+00:00' WHERE id=?1",
            [high.id.to_string()],
        )
        .unwrap();
        conn.execute(
            "UPDATE jobs SET created_at='2026-01-01T00:00:03+00:00' WHERE id=?1",
            [low_new.id.to_string()],
        )
        .unwrap();

        let first = claim_next(&conn).unwrap().unwrap();
        assert_eq!(first.id, high.id);
        let second = claim_next(&conn).unwrap().unwrap();
        assert_eq!(second.id, low_old.id);
        let third = claim_next(&conn).unwrap().unwrap();
        assert_eq!(third.id, low_new.id);
        assert!(claim_next(&conn).unwrap().is_none());
    }

    #[test]
    fn claim_sets_running_and_started_at() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();

        enqueue(&conn, "t", &serde_json::json!({}), 0).unwrap();
        let claimed = claim_next(&conn).unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(claimed.started_at.is_some());
    }

    #[test]
    fn terminal_transitions() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();

        let a = enqueue(&conn, "t", &serde_json::json!({}), 0).unwrap();
        let b = enqueue(&conn, "t", &serde_json::json!({}), 0).unwrap();

        assert!(mark_done(&conn, a.id).unwrap());
        let a = get_job(&conn, a.id).unwrap().unwrap();
        assert_eq!(a.status, JobStatus::Done);
        assert!(a.finished_at.is_some());

        assert!(mark_error(&conn, b.id, "boom").unwrap());
        let b = get_job(&conn, b.id).unwrap().unwrap();
        assert_eq!(b.status, JobStatus::Error);
        assert_eq!(b.error.as_deref(), Some("boom"));
    }

    #[test]
    fn cancel_only_from_queued() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();

        let job = enqueue(&conn, "t", &serde_json::json!({}), 0).unwrap();
        assert!(cancel(&conn, job.id).unwrap());
        let job = get_job(&conn, job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Canceled);

        // Canceled jobs are not claimable.
        assert!(claim_next(&conn).unwrap().is_none());

        // A running job refuses cancellation.
        let running = enqueue(&conn, "t", &serde_json::json!({}), 0).unwrap();
        claim_next(&conn).unwrap().unwrap();
        assert!(!cancel(&conn, running.id).unwrap());
    }

    #[test]
    fn stale_sweep_recovers_old_running_jobs() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();

        let job = enqueue(&conn, "t", &serde_json::json!({}), 0).unwrap();
        claim_next(&conn).unwrap().unwrap();

        // Fresh running job is not swept.
        assert_eq!(reset_stale_running(&conn, Duration::minutes(10)).unwrap(), 0);

        // Backdate started_at past the threshold.
        let old = (Utc::now() - Duration::hours(1)).to_rfc3339();
        conn.execute(
            "UPDATE jobs SET started_at=?1 WHERE id=?2",
            rusqlite::params![old, job.id.to_string()],
        )
        .unwrap();

        assert_eq!(reset_stale_running(&conn, Duration::minutes(10)).unwrap(), 1);
        let recovered = get_job(&conn, job.id).unwrap().unwrap();
        assert_eq!(recovered.status, JobStatus::Queued);
        assert!(recovered.started_at.is_none());

        // And it is claimable again.
        assert_eq!(claim_next(&conn).unwrap().unwrap().id, job.id);
    }

    #[test]
    fn list_and_count() {
        let pool = init_memory_pool().unwrap();
        let conn = get_conn(&pool).unwrap();

        for _ in 0..3 {
            enqueue(&conn, "t", &serde_json::json!({}), 0).unwrap();
        }
        claim_next(&conn).unwrap().unwrap();

        assert_eq!(count_by_status(&conn, JobStatus::Queued).unwrap(), 2);
        assert_eq!(count_by_status(&conn, JobStatus::Running).unwrap(), 1);
        assert_eq!(
            list_jobs(&conn, Some(JobStatus::Queued), 10, 0).unwrap().len(),
            2
        );
        assert_eq!(list_jobs(&conn, None, 10, 0).unwrap().len(), 3);
        assert_eq!(list_jobs(&conn, None, 10, 2).unwrap().len(), 1);
    }
}
