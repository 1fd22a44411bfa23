//! Table definitions for the export job store.

use sqlx::SqlitePool;

use crate::error::Result;

const CREATE_EXPORT_JOBS: &str = r#"
CREATE TABLE IF NOT EXISTS export_jobs (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'QUEUED',
    query_json TEXT NOT NULL,
    output_format TEXT NOT NULL,
    notify_target_json TEXT NOT NULL,
    requested_by_json TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    expires_at INTEGER,
    file_id TEXT,
    total_executions INTEGER,
    error_message TEXT,
    next_iteration INTEGER NOT NULL,
    lease_owner TEXT,
    lease_expires_at INTEGER,
    attempts INTEGER NOT NULL DEFAULT 0
)
"#;

// Export iterator scans by (status, next_iteration); cleanup by (status, expires_at).
const CREATE_CLAIM_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_export_jobs_claim
ON export_jobs(status, next_iteration)
"#;

const CREATE_EXPIRY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_export_jobs_expiry
ON export_jobs(status, expires_at)
"#;

const CREATE_ACCOUNT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_export_jobs_account
ON export_jobs(account_id, created_at DESC)
"#;

pub(crate) async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    for ddl in [
        CREATE_EXPORT_JOBS,
        CREATE_CLAIM_INDEX,
        CREATE_EXPIRY_INDEX,
        CREATE_ACCOUNT_INDEX,
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}
