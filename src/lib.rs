//! vodworks: a background job-processing core paired with an adaptive
//! media-transcoding pipeline.
//!
//! External collaborators enqueue jobs and register handlers; the
//! [`runner::JobRunner`] claims persisted jobs from the store, dispatches
//! them, and applies retry/backoff and crash-recovery policy. The shipped
//! [`handlers::TranscodeHandler`] drives the transcode engine in
//! [`vw_av`].

pub mod handlers;
pub mod registry;
pub mod runner;

pub use registry::{HandlerRegistry, JobHandler, TerminalHook};
pub use runner::JobRunner;
