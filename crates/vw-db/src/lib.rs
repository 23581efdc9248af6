//! Durable job store for vodworks.
//!
//! SQLite via `rusqlite` behind an `r2d2` pool. The `jobs` table is the
//! single source of truth for job state; the claim operation is a single
//! atomic `UPDATE ... RETURNING` so no two claimers can receive the same
//! row.

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;

pub use models::Job;
pub use pool::{get_conn, init_memory_pool, init_pool, DbPool, PooledConnection};
