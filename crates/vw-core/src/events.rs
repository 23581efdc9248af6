//! Runner event system.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel so external
//! collaborators (dashboards, tests) can observe scheduler activity
//! without the runner knowing about them.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ids::JobId;

/// Default broadcast channel capacity.
const CHANNEL_CAPACITY: usize = 256;

/// Something the job runner did during a tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerEvent {
    /// A tick finished, regardless of whether a job was claimed.
    Tick,
    /// A job was claimed and its handler invoked.
    JobStarted { job_id: JobId, kind: String },
    /// A job's handler succeeded.
    JobCompleted { job_id: JobId },
    /// A job's handler failed and a retry was requeued.
    JobRetried {
        job_id: JobId,
        retry_job_id: JobId,
        attempt: u32,
    },
    /// A job exhausted its retries and was permanently errored.
    JobFailed { job_id: JobId, error: String },
    /// The stale sweep recovered jobs stuck in `running`.
    JobsRecovered { count: usize },
}

/// Broadcast bus for [`RunnerEvent`]s.
///
/// Sends are fire-and-forget: a send with no live subscribers is not an
/// error.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<RunnerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event to all current subscribers.
    pub fn broadcast(&self, event: RunnerEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("no subscribers for runner event");
        }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.tx.subscribe()
    }
}
