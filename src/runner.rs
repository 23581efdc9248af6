//! The job runner (scheduler).
//!
//! A cooperative polling loop: a fixed-interval timer (or an explicit
//! `poke`) drives [`JobRunner::tick`], which claims at most one job from
//! the store and dispatches it to its registered handler. A re-entrancy
//! guard means overlapping ticks never run concurrently on one runner, so
//! a slow handler delays the next claim rather than racing it.
//!
//! Failure policy: a failed attempt is requeued as a **new** job carrying
//! `retry_count + 1` in its payload with priority decayed by one (floored
//! at 0); the original row is marked `done` so the audit log holds one
//! terminal `error` row per distinct failure. Once retries are exhausted
//! the job is marked `error` and the kind's terminal-failure hook (if
//! any) fires.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use vw_core::config::RunnerConfig;
use vw_core::events::{EventBus, RunnerEvent};
use vw_core::{Error, Result};
use vw_db::models::Job;
use vw_db::queries::jobs;
use vw_db::{get_conn, DbPool};

use crate::registry::HandlerRegistry;

/// Claims jobs from the store and dispatches them to registered handlers.
///
/// One instance per process; tests call [`tick`](Self::tick) directly for
/// determinism instead of relying on the wall-clock loop.
pub struct JobRunner {
    db: DbPool,
    registry: Arc<HandlerRegistry>,
    config: RunnerConfig,
    events: Arc<EventBus>,
    ticking: AtomicBool,
    tick_count: AtomicU64,
    poke: Notify,
}

impl JobRunner {
    pub fn new(db: DbPool, registry: Arc<HandlerRegistry>, config: RunnerConfig) -> Self {
        Self {
            db,
            registry,
            config,
            events: Arc::new(EventBus::new()),
            ticking: AtomicBool::new(false),
            tick_count: AtomicU64::new(0),
            poke: Notify::new(),
        }
    }

    /// The event bus this runner publishes to.
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    /// Request an immediate tick from the polling loop.
    ///
    /// Used after a fresh enqueue to cut latency below the poll interval.
    pub fn poke(&self) {
        self.poke.notify_one();
    }

    /// Enqueue a job and poke the loop.
    pub fn enqueue_job(
        &self,
        kind: &str,
        payload: &serde_json::Value,
        priority: i64,
    ) -> Result<Job> {
        let conn = get_conn(&self.db)?;
        let job = jobs::enqueue(&conn, kind, payload, priority)?;
        tracing::debug!(job_id = %job.id, kind, priority, "enqueued job");
        self.poke();
        Ok(job)
    }

    /// Run one scheduling step: periodic stale sweep, claim, dispatch.
    ///
    /// Returns `Ok(true)` if a job was processed, `Ok(false)` if there was
    /// nothing to do (or an overlapping tick was skipped). Fires
    /// [`RunnerEvent::Tick`] after every executed tick regardless of
    /// outcome.
    pub async fn tick(&self) -> Result<bool> {
        // Re-entrancy guard: overlapping ticks are skipped, not queued.
        if self.ticking.swap(true, Ordering::SeqCst) {
            tracing::trace!("skipping overlapping tick");
            return Ok(false);
        }

        let result = self.tick_inner().await;
        self.ticking.store(false, Ordering::SeqCst);
        self.events.broadcast(RunnerEvent::Tick);
        result
    }

    async fn tick_inner(&self) -> Result<bool> {
        let n = self.tick_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.config.sweep_every_ticks > 0 && n % self.config.sweep_every_ticks == 0 {
            self.sweep_stale()?;
        }

        let conn = get_conn(&self.db)?;
        let Some(job) = jobs::claim_next(&conn)? else {
            return Ok(false);
        };
        jobs::mark_running(&conn, job.id)?;
        drop(conn);

        tracing::info!(job_id = %job.id, kind = %job.kind, "processing job");
        self.events.broadcast(RunnerEvent::JobStarted {
            job_id: job.id,
            kind: job.kind.clone(),
        });

        let outcome = match self.registry.get(&job.kind) {
            Some(handler) => handler.run(&self.db, job.payload.clone()).await,
            None => Err(Error::HandlerMissing(job.kind.clone())),
        };

        match outcome {
            Ok(()) => {
                let conn = get_conn(&self.db)?;
                jobs::mark_done(&conn, job.id)?;
                tracing::info!(job_id = %job.id, "job completed");
                self.events
                    .broadcast(RunnerEvent::JobCompleted { job_id: job.id });
            }
            Err(e) => self.handle_failure(&job, e).await?,
        }

        Ok(true)
    }

    /// Crash recovery: reset jobs stuck in `running` past the threshold.
    fn sweep_stale(&self) -> Result<()> {
        let conn = get_conn(&self.db)?;
        let stale_after = chrono::Duration::seconds(self.config.stale_after_secs as i64);
        let recovered = jobs::reset_stale_running(&conn, stale_after)?;
        if recovered > 0 {
            tracing::info!(recovered, "recovered stale running jobs");
            self.events
                .broadcast(RunnerEvent::JobsRecovered { count: recovered });
        }
        Ok(())
    }

    /// Retry with priority decay, or mark permanently failed.
    async fn handle_failure(&self, job: &Job, error: Error) -> Result<()> {
        let attempt = job.retry_count();

        // The retry counter is payload-carried; a payload that is not a
        // JSON object cannot carry one, so such jobs fail terminally on
        // the first error.
        let can_retry = job.payload.is_object() && attempt < self.config.max_retries;

        if can_retry {
            let mut payload = job.payload.clone();
            if let serde_json::Value::Object(ref mut map) = payload {
                map.insert(
                    "retry_count".to_string(),
                    serde_json::Value::from(attempt + 1),
                );
            }
            let new_priority = (job.priority - 1).max(0);

            let conn = get_conn(&self.db)?;
            let retry = jobs::enqueue(&conn, &job.kind, &payload, new_priority)?;
            // The original row is superseded by the requeue, not failed:
            // only the terminal attempt writes an error row.
            jobs::mark_done(&conn, job.id)?;
            drop(conn);

            tracing::warn!(
                job_id = %job.id,
                retry_job_id = %retry.id,
                attempt = attempt + 1,
                "job failed, requeued: {error}"
            );
            self.events.broadcast(RunnerEvent::JobRetried {
                job_id: job.id,
                retry_job_id: retry.id,
                attempt: attempt + 1,
            });
            self.poke();
        } else {
            let message = error.to_string();
            let conn = get_conn(&self.db)?;
            jobs::mark_error(&conn, job.id, &message)?;
            drop(conn);

            tracing::error!(job_id = %job.id, kind = %job.kind, "job permanently failed: {message}");
            self.events.broadcast(RunnerEvent::JobFailed {
                job_id: job.id,
                error: message.clone(),
            });

            if let Some(hook) = self.registry.terminal_hook(&job.kind) {
                hook(self.db.clone(), job.payload.clone(), message).await;
            }
        }

        Ok(())
    }

    /// Production loop: tick on a fixed interval, on `poke`, and drain
    /// consecutive jobs without sleeping in between. Runs until the
    /// cancellation token fires.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!("job runner started");
        let interval = Duration::from_millis(self.config.tick_interval_ms.max(1));

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.tick().await {
                Ok(true) => {
                    // Processed a job; immediately check for the next one.
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("job runner tick error: {e}");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.poke.notified() => {}
                _ = cancel.cancelled() => break,
            }
        }

        tracing::info!("job runner stopped");
    }
}

impl std::fmt::Debug for JobRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRunner")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("ticks", &self.tick_count.load(Ordering::Relaxed))
            .finish()
    }
}
