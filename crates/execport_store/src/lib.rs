//! Persistent export job queue for the execution export pipeline.
//!
//! Every node in the cluster shares one store. Jobs are handed out through
//! time-bounded leases so that at most one node works on a job at a time,
//! and a crashed node's jobs become claimable again once its lease lapses.
//!
//! # Usage
//!
//! ```rust,ignore
//! use execport_store::{ClaimKind, JobStore, SqliteJobStore};
//!
//! let store = SqliteJobStore::open("~/.execport/jobs.sqlite3").await?;
//! let jobs = store.claim(ClaimKind::Export, "node-a", lease, 3).await?;
//! ```

mod error;
mod schema;
mod sqlite;
mod traits;
mod types;

pub use error::{Result, StoreError};
pub use sqlite::SqliteJobStore;
pub use traits::JobStore;
pub use types::*;
