//! Handler registration.
//!
//! External collaborators map job kinds to handlers; the core ships with
//! none (the binary wires up [`crate::handlers::TranscodeHandler`]). A
//! kind may also carry an optional terminal-failure hook, invoked once
//! when a job of that kind exhausts its retries.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;

use vw_db::DbPool;

/// A handler for one job kind.
///
/// Handlers must be idempotent: crash recovery gives at-least-once
/// execution, not exactly-once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute the job. The payload is whatever the enqueuer supplied;
    /// only this handler interprets it.
    async fn run(&self, db: &DbPool, payload: serde_json::Value) -> vw_core::Result<()>;
}

/// Side-effect callback fired when a job exhausts its retries.
pub type TerminalHook =
    Arc<dyn Fn(DbPool, serde_json::Value, String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Adapter so plain async closures can serve as handlers.
struct FnHandler<F>(F);

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: Fn(DbPool, serde_json::Value) -> BoxFuture<'static, vw_core::Result<()>> + Send + Sync,
{
    async fn run(&self, db: &DbPool, payload: serde_json::Value) -> vw_core::Result<()> {
        (self.0)(db.clone(), payload).await
    }
}

/// Mapping from job kind to handler, plus optional terminal-failure hooks.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    terminal_hooks: RwLock<HashMap<String, TerminalHook>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job kind, replacing any previous one.
    pub fn register(&self, kind: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.write().insert(kind.into(), handler);
    }

    /// Register a closure as the handler for a job kind.
    pub fn register_fn<F>(&self, kind: impl Into<String>, f: F)
    where
        F: Fn(DbPool, serde_json::Value) -> BoxFuture<'static, vw_core::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.register(kind, Arc::new(FnHandler(f)));
    }

    /// Register a terminal-failure hook for a job kind.
    pub fn register_terminal_hook(&self, kind: impl Into<String>, hook: TerminalHook) {
        self.terminal_hooks.write().insert(kind.into(), hook);
    }

    /// Look up the handler for a kind.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().get(kind).cloned()
    }

    /// Look up the terminal-failure hook for a kind.
    pub fn terminal_hook(&self, kind: &str) -> Option<TerminalHook> {
        self.terminal_hooks.read().get(kind).cloned()
    }

    /// All registered kinds, for diagnostics.
    pub fn kinds(&self) -> Vec<String> {
        self.handlers.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
