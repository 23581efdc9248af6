//! Job runner integration tests.
//!
//! The runner's `tick()` is driven directly so nothing here depends on
//! wall-clock timers.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;

use common::TestHarness;
use vw_core::config::RunnerConfig;
use vw_core::events::RunnerEvent;
use vw_db::models::JobStatus;
use vw_db::queries::jobs;

/// Register a handler that counts invocations and returns a fixed result.
fn counting_handler(harness: &TestHarness, kind: &str, succeed: bool) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);
    harness.registry.register_fn(kind, move |_db, _payload| {
        let calls = Arc::clone(&calls_clone);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if succeed {
                Ok(())
            } else {
                Err(vw_core::Error::internal("handler always fails"))
            }
        }
        .boxed()
    });
    calls
}

// ---------------------------------------------------------------------------
// Success path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_job_is_marked_done() {
    let harness = TestHarness::new();
    let calls = counting_handler(&harness, "noop", true);
    let mut events = harness.runner.events().subscribe();

    let job = harness
        .runner
        .enqueue_job("noop", &serde_json::json!({}), 0)
        .unwrap();

    assert!(harness.runner.tick().await.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let conn = harness.conn();
    let done = jobs::get_job(&conn, job.id).unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Done);
    assert!(done.started_at.is_some());
    assert!(done.finished_at.is_some());
    assert!(done.error.is_none());

    // JobStarted, JobCompleted, then the unconditional Tick.
    assert!(matches!(
        events.try_recv().unwrap(),
        RunnerEvent::JobStarted { .. }
    ));
    assert!(matches!(
        events.try_recv().unwrap(),
        RunnerEvent::JobCompleted { .. }
    ));
    assert!(matches!(events.try_recv().unwrap(), RunnerEvent::Tick));
}

#[tokio::test]
async fn empty_queue_tick_is_a_noop() {
    let harness = TestHarness::new();
    let mut events = harness.runner.events().subscribe();

    assert!(!harness.runner.tick().await.unwrap());
    // Tick still fires with nothing to do.
    assert!(matches!(events.try_recv().unwrap(), RunnerEvent::Tick));
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_handler_retries_with_priority_decay_then_errors() {
    let harness = TestHarness::new();
    let calls = counting_handler(&harness, "doomed", false);

    harness
        .runner
        .enqueue_job("doomed", &serde_json::json!({"input": "x"}), 2)
        .unwrap();

    // max_retries = 3: attempts run on 4 consecutive ticks, each claiming
    // the requeued successor of the previous one.
    let mut seen_priorities = Vec::new();
    for _ in 0..4 {
        {
            let conn = harness.conn();
            let queued = jobs::list_jobs(&conn, Some(JobStatus::Queued), 10, 0).unwrap();
            assert_eq!(queued.len(), 1);
            seen_priorities.push(queued[0].priority);
        }
        assert!(harness.runner.tick().await.unwrap());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(seen_priorities, vec![2, 1, 0, 0]);

    let conn = harness.conn();
    // Nothing left to claim.
    assert!(!harness.runner.tick().await.unwrap());

    // Three superseded rows marked done, one terminal error row.
    assert_eq!(jobs::count_by_status(&conn, JobStatus::Done).unwrap(), 3);
    assert_eq!(jobs::count_by_status(&conn, JobStatus::Error).unwrap(), 1);

    let errored = jobs::list_jobs(&conn, Some(JobStatus::Error), 10, 0).unwrap();
    assert_eq!(errored[0].retry_count(), 3);
    assert!(errored[0]
        .error
        .as_deref()
        .unwrap()
        .contains("handler always fails"));
}

#[tokio::test]
async fn unregistered_kind_retries_then_errors_naming_the_kind() {
    let harness = TestHarness::new();

    harness
        .runner
        .enqueue_job("noop-missing", &serde_json::json!({}), 0)
        .unwrap();

    // 4 total attempts: the original plus MAX_RETRIES requeues.
    for _ in 0..4 {
        assert!(harness.runner.tick().await.unwrap());
    }
    assert!(!harness.runner.tick().await.unwrap());

    let conn = harness.conn();
    let errored = jobs::list_jobs(&conn, Some(JobStatus::Error), 10, 0).unwrap();
    assert_eq!(errored.len(), 1);
    assert!(errored[0].error.as_deref().unwrap().contains("noop-missing"));
}

#[tokio::test]
async fn non_object_payload_fails_terminally_on_first_error() {
    let harness = TestHarness::new();
    let calls = counting_handler(&harness, "doomed", false);

    // An array payload cannot carry a retry counter.
    let job = harness
        .runner
        .enqueue_job("doomed", &serde_json::json!([1, 2, 3]), 0)
        .unwrap();

    assert!(harness.runner.tick().await.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let conn = harness.conn();
    let row = jobs::get_job(&conn, job.id).unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Error);
}

// ---------------------------------------------------------------------------
// Terminal-failure hook
// ---------------------------------------------------------------------------

#[tokio::test]
async fn terminal_hook_fires_once_with_the_error() {
    let harness = TestHarness::with_runner_config(RunnerConfig {
        max_retries: 0,
        ..RunnerConfig::default()
    });
    counting_handler(&harness, "doomed", false);

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    harness.registry.register_terminal_hook(
        "doomed",
        Arc::new(move |_db, payload, error| {
            let seen = Arc::clone(&seen_clone);
            async move {
                seen.lock().push(format!("{payload}:{error}"));
            }
            .boxed()
        }),
    );

    harness
        .runner
        .enqueue_job("doomed", &serde_json::json!({"media_id": "m9"}), 0)
        .unwrap();

    assert!(harness.runner.tick().await.unwrap());
    assert!(!harness.runner.tick().await.unwrap());

    let recorded = seen.lock();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].contains("m9"));
    assert!(recorded[0].contains("handler always fails"));
}

#[tokio::test]
async fn hook_for_other_kind_does_not_fire() {
    let harness = TestHarness::with_runner_config(RunnerConfig {
        max_retries: 0,
        ..RunnerConfig::default()
    });
    counting_handler(&harness, "doomed", false);

    let fired = Arc::new(AtomicUsize::new(0));
    let fired_clone = Arc::clone(&fired);
    harness.registry.register_terminal_hook(
        "other-kind",
        Arc::new(move |_db, _payload, _error| {
            let fired = Arc::clone(&fired_clone);
            async move {
                fired.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        }),
    );

    harness
        .runner
        .enqueue_job("doomed", &serde_json::json!({}), 0)
        .unwrap();
    harness.runner.tick().await.unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Stale recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_job_is_recovered_and_reprocessed() {
    // Sweep on every tick so the test doesn't need 100 of them.
    let harness = TestHarness::with_runner_config(RunnerConfig {
        sweep_every_ticks: 1,
        stale_after_secs: 60,
        ..RunnerConfig::default()
    });
    let calls = counting_handler(&harness, "noop", true);
    let mut events = harness.runner.events().subscribe();

    // Simulate a crash: job claimed by a previous process that died.
    let job = harness
        .runner
        .enqueue_job("noop", &serde_json::json!({}), 0)
        .unwrap();
    {
        let conn = harness.conn();
        jobs::claim_next(&conn).unwrap().unwrap();
        let old = (chrono::Utc::now() - chrono::Duration::hours(1)).to_rfc3339();
        conn.execute(
            "UPDATE jobs SET started_at=?1 WHERE id=?2",
            rusqlite::params![old, job.id.to_string()],
        )
        .unwrap();
    }

    // The sweep runs at the start of the tick, so the recovered job is
    // claimed and processed within the same tick.
    assert!(harness.runner.tick().await.unwrap());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let conn = harness.conn();
    let done = jobs::get_job(&conn, job.id).unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Done);

    assert!(matches!(
        events.try_recv().unwrap(),
        RunnerEvent::JobsRecovered { count: 1 }
    ));
}

// ---------------------------------------------------------------------------
// Re-entrancy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn overlapping_ticks_are_skipped() {
    let harness = TestHarness::new();

    // Handler blocks until released so the first tick stays in flight.
    let gate = Arc::new(tokio::sync::Semaphore::new(0));
    let gate_clone = Arc::clone(&gate);
    harness.registry.register_fn("slow", move |_db, _payload| {
        let gate = Arc::clone(&gate_clone);
        async move {
            let _permit = gate.acquire().await.map_err(|_| {
                vw_core::Error::internal("gate closed")
            })?;
            Ok(())
        }
        .boxed()
    });

    harness
        .runner
        .enqueue_job("slow", &serde_json::json!({}), 0)
        .unwrap();
    harness
        .runner
        .enqueue_job("slow", &serde_json::json!({}), 0)
        .unwrap();

    let runner = Arc::clone(&harness.runner);
    let first = tokio::spawn(async move { runner.tick().await });

    // Give the first tick time to claim and block in the handler.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // The overlapping tick must bail out without claiming the second job.
    assert!(!harness.runner.tick().await.unwrap());
    {
        let conn = harness.conn();
        assert_eq!(jobs::count_by_status(&conn, JobStatus::Queued).unwrap(), 1);
    }

    gate.add_permits(2);
    assert!(first.await.unwrap().unwrap());

    // With the guard released, the second job processes normally.
    assert!(harness.runner.tick().await.unwrap());
    let conn = harness.conn();
    assert_eq!(jobs::count_by_status(&conn, JobStatus::Done).unwrap(), 2);
}
