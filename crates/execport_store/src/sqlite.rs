//! SQLite implementation of [`JobStore`] using sqlx.

use async_trait::async_trait;
use execport_ids::{AccountId, ExportJobId, FileId};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::schema::ensure_schema;
use crate::traits::JobStore;
use crate::types::{
    now_millis, ClaimKind, ExportJob, ExportStatus, Lease, NewExportJob, OutputFormat,
    QueueStats, ReadyUpdate,
};

/// SQLite-backed job store.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open or create a database at the given path. Creates tables if missing.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let store = Self { pool };
        ensure_schema(&store.pool).await?;
        info!(path = %path.display(), "Job store opened");
        Ok(store)
    }

    /// Private in-memory database. Single connection, so it lives as long as the pool.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        ensure_schema(&store.pool).await?;
        Ok(store)
    }

    /// Wrap an existing pool. Tables are created if missing.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        ensure_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Underlying pool (escape hatch for tests and admin tooling).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Work out why a conditional update matched nothing.
    async fn explain_miss(
        &self,
        id: &ExportJobId,
        owner: &str,
        target: Option<ExportStatus>,
    ) -> StoreError {
        match self.get(id).await {
            Ok(None) => StoreError::NotFound(id.clone()),
            Ok(Some(job)) => match target {
                Some(to) if !job.status.can_transition_to(to) => StoreError::InvalidTransition {
                    job_id: id.clone(),
                    from: job.status,
                    to,
                },
                _ => StoreError::LeaseLost {
                    job_id: id.clone(),
                    owner: owner.to_string(),
                },
            },
            Err(e) => e,
        }
    }
}

fn lease_millis(lease: Duration) -> i64 {
    i64::try_from(lease.as_millis()).unwrap_or(i64::MAX)
}

fn row_to_job(row: &SqliteRow) -> Result<ExportJob> {
    let id: String = row.try_get("id")?;
    let id = ExportJobId::parse(&id).map_err(|e| StoreError::corrupt(e.to_string()))?;

    let status: String = row.try_get("status")?;
    let status = ExportStatus::parse(&status)
        .ok_or_else(|| StoreError::corrupt(format!("Unknown export status: {}", status)))?;

    let format: String = row.try_get("output_format")?;
    let output_format = OutputFormat::parse(&format)
        .ok_or_else(|| StoreError::corrupt(format!("Unknown output format: {}", format)))?;

    let query_json: String = row.try_get("query_json")?;
    let notify_json: String = row.try_get("notify_target_json")?;
    let requested_by_json: String = row.try_get("requested_by_json")?;

    let lease_owner: Option<String> = row.try_get("lease_owner")?;
    let lease_expires_at: Option<i64> = row.try_get("lease_expires_at")?;
    let lease = match (lease_owner, lease_expires_at) {
        (Some(owner), Some(expires_at)) => Some(Lease { owner, expires_at }),
        _ => None,
    };

    let account_id: String = row.try_get("account_id")?;
    let file_id: Option<String> = row.try_get("file_id")?;

    Ok(ExportJob {
        id,
        account_id: AccountId::from(account_id),
        status,
        query: serde_json::from_str(&query_json)?,
        output_format,
        notify_target: serde_json::from_str(&notify_json)?,
        requested_by: serde_json::from_str(&requested_by_json)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        expires_at: row.try_get("expires_at")?,
        file_id: file_id.map(FileId::from),
        total_executions: row.try_get("total_executions")?,
        error_message: row.try_get("error_message")?,
        next_iteration: row.try_get("next_iteration")?,
        lease,
        attempts: row.try_get("attempts")?,
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: NewExportJob) -> Result<ExportJob> {
        let id = ExportJobId::new();
        let now = now_millis();

        let row = sqlx::query(
            r#"
            INSERT INTO export_jobs (
                id, account_id, status, query_json, output_format, notify_target_json,
                requested_by_json, created_at, updated_at, next_iteration, attempts
            )
            VALUES (?1, ?2, 'QUEUED', ?3, ?4, ?5, ?6, ?7, ?7, ?7, 0)
            RETURNING *
            "#,
        )
        .bind(id.as_str())
        .bind(job.account_id.as_str())
        .bind(serde_json::to_string(&job.query)?)
        .bind(job.output_format.as_str())
        .bind(serde_json::to_string(&job.notify_target)?)
        .bind(serde_json::to_string(&job.requested_by)?)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let job = row_to_job(&row)?;
        info!(job_id = %job.id, account_id = %job.account_id, "Export job queued");
        Ok(job)
    }

    async fn get(&self, id: &ExportJobId) -> Result<Option<ExportJob>> {
        let row = sqlx::query("SELECT * FROM export_jobs WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn list(&self, status: Option<ExportStatus>, limit: usize) -> Result<Vec<ExportJob>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM export_jobs WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2",
                )
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM export_jobs ORDER BY created_at DESC LIMIT ?1")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter().map(row_to_job).collect()
    }

    async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(CASE WHEN status = 'QUEUED' THEN 1 ELSE 0 END), 0) AS queued,
                COALESCE(SUM(CASE WHEN status = 'READY' THEN 1 ELSE 0 END), 0) AS ready,
                COALESCE(SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END), 0) AS failed,
                COALESCE(SUM(CASE WHEN status = 'EXPIRED' THEN 1 ELSE 0 END), 0) AS expired,
                COALESCE(SUM(CASE WHEN lease_expires_at >= ?1 THEN 1 ELSE 0 END), 0) AS leased
            FROM export_jobs
            "#,
        )
        .bind(now_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            queued: row.try_get::<i64, _>("queued")? as u64,
            ready: row.try_get::<i64, _>("ready")? as u64,
            failed: row.try_get::<i64, _>("failed")? as u64,
            expired: row.try_get::<i64, _>("expired")? as u64,
            leased: row.try_get::<i64, _>("leased")? as u64,
        })
    }

    async fn claim(
        &self,
        kind: ClaimKind,
        owner: &str,
        lease: Duration,
        limit: usize,
    ) -> Result<Vec<ExportJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let predicate = match kind {
            ClaimKind::Export => "status = 'QUEUED' AND next_iteration <= ?1",
            ClaimKind::Cleanup => {
                "status = 'READY' AND expires_at IS NOT NULL AND expires_at < ?1 \
                 AND next_iteration <= ?1"
            }
        };
        let attempt_bump: i64 = match kind {
            ClaimKind::Export => 1,
            ClaimKind::Cleanup => 0,
        };

        // The lease check is repeated on the outer UPDATE so a row leased by
        // another writer between the subquery and the update is skipped.
        let sql = format!(
            r#"
            UPDATE export_jobs
            SET lease_owner = ?2,
                lease_expires_at = ?3,
                attempts = attempts + ?4,
                updated_at = ?1
            WHERE id IN (
                SELECT id FROM export_jobs
                WHERE {predicate}
                  AND (lease_expires_at IS NULL OR lease_expires_at < ?1)
                ORDER BY created_at ASC
                LIMIT ?5
            )
              AND (lease_expires_at IS NULL OR lease_expires_at < ?1)
            RETURNING *
            "#
        );

        let now = now_millis();
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(owner)
            .bind(now.saturating_add(lease_millis(lease)))
            .bind(attempt_bump)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let mut jobs = rows.iter().map(row_to_job).collect::<Result<Vec<_>>>()?;
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        if !jobs.is_empty() {
            debug!(kind = kind.as_str(), owner, count = jobs.len(), "Claimed export jobs");
        }
        Ok(jobs)
    }

    async fn renew_lease(&self, id: &ExportJobId, owner: &str, lease: Duration) -> Result<()> {
        let now = now_millis();
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET lease_expires_at = ?3, updated_at = ?4
            WHERE id = ?1 AND lease_owner = ?2
            "#,
        )
        .bind(id.as_str())
        .bind(owner)
        .bind(now.saturating_add(lease_millis(lease)))
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.explain_miss(id, owner, None).await);
        }
        Ok(())
    }

    async fn release(&self, id: &ExportJobId, owner: &str, next_iteration: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET lease_owner = NULL,
                lease_expires_at = NULL,
                next_iteration = ?3,
                updated_at = ?4
            WHERE id = ?1 AND lease_owner = ?2
            "#,
        )
        .bind(id.as_str())
        .bind(owner)
        .bind(next_iteration)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.explain_miss(id, owner, None).await);
        }
        debug!(job_id = %id, owner, next_iteration, "Released export job lease");
        Ok(())
    }

    async fn mark_ready(
        &self,
        id: &ExportJobId,
        owner: &str,
        update: ReadyUpdate,
    ) -> Result<ExportJob> {
        let row = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'READY',
                file_id = ?3,
                total_executions = ?4,
                expires_at = ?5,
                error_message = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = ?6
            WHERE id = ?1 AND lease_owner = ?2 AND status = 'QUEUED'
            RETURNING *
            "#,
        )
        .bind(id.as_str())
        .bind(owner)
        .bind(update.file_id.as_str())
        .bind(update.total_executions)
        .bind(update.expires_at)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(self.explain_miss(id, owner, Some(ExportStatus::Ready)).await),
        }
    }

    async fn mark_failed(&self, id: &ExportJobId, owner: &str, error: &str) -> Result<ExportJob> {
        let row = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'FAILED',
                error_message = ?3,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = ?4
            WHERE id = ?1 AND lease_owner = ?2 AND status = 'QUEUED'
            RETURNING *
            "#,
        )
        .bind(id.as_str())
        .bind(owner)
        .bind(error)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(self.explain_miss(id, owner, Some(ExportStatus::Failed)).await),
        }
    }

    async fn mark_expired(&self, id: &ExportJobId, owner: &str) -> Result<ExportJob> {
        let row = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'EXPIRED',
                file_id = NULL,
                lease_owner = NULL,
                lease_expires_at = NULL,
                updated_at = ?3
            WHERE id = ?1 AND lease_owner = ?2 AND status IN ('READY', 'FAILED')
            RETURNING *
            "#,
        )
        .bind(id.as_str())
        .bind(owner)
        .bind(now_millis())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(self.explain_miss(id, owner, Some(ExportStatus::Expired)).await),
        }
    }
}
