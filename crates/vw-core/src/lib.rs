//! Shared foundation for vodworks: error type, typed IDs, configuration,
//! and the runner event bus.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;

pub use error::{Error, Result};
pub use ids::JobId;
