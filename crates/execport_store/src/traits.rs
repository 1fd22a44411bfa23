//! Job store interface.
//!
//! Lease ownership is the only synchronisation between worker processes:
//! `claim` hands out exclusive, time-bounded leases through one conditional
//! update, and every later mutation is conditional on still holding it.

use async_trait::async_trait;
use execport_ids::ExportJobId;
use std::time::Duration;

use crate::error::Result;
use crate::types::{ClaimKind, ExportJob, ExportStatus, NewExportJob, QueueStats, ReadyUpdate};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new QUEUED job, claimable immediately.
    async fn insert(&self, job: NewExportJob) -> Result<ExportJob>;

    async fn get(&self, id: &ExportJobId) -> Result<Option<ExportJob>>;

    /// Most recently created first.
    async fn list(&self, status: Option<ExportStatus>, limit: usize) -> Result<Vec<ExportJob>>;

    async fn stats(&self) -> Result<QueueStats>;

    /// Lease up to `limit` claimable jobs to `owner` for `lease`.
    ///
    /// A job is claimable when it matches `kind` and carries no lease or an
    /// expired one. Export claims bump the attempt counter. Returned jobs are
    /// ordered oldest first.
    async fn claim(
        &self,
        kind: ClaimKind,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ExportJob>>;

    /// Push the lease deadline out by `lease` from now.
    async fn renew_lease(&self, id: &ExportJobId, owner: &str, lease: Duration) -> Result<()>;

    /// Give the job back without changing its status. It becomes claimable
    /// again at `next_iteration`.
    async fn release(&self, id: &ExportJobId, owner: &str, next_iteration: i64) -> Result<()>;

    /// QUEUED -> READY. Clears the lease.
    async fn mark_ready(
        &self,
        id: &ExportJobId,
        owner: &str,
        update: ReadyUpdate,
    ) -> Result<ExportJob>;

    /// QUEUED -> FAILED. Clears the lease.
    async fn mark_failed(&self, id: &ExportJobId, owner: &str, error: &str) -> Result<ExportJob>;

    /// READY|FAILED -> EXPIRED. Clears the lease and the file reference.
    async fn mark_expired(&self, id: &ExportJobId, owner: &str) -> Result<ExportJob>;
}
