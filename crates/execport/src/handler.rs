//! Export job lifecycle: page through executions, enrich, archive, upload,
//! mark READY, notify. Failures are settled here so the scheduler only ever
//! sees store errors.

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use execport_ids::{ExportJobId, FileId};
use execport_store::{now_millis, ClaimKind, ExportJob, JobStore, ReadyUpdate};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::archive::{ArchiveContext, ArchiveWriter};
use crate::collaborators::Collaborators;
use crate::config::ExportConfig;
use crate::error::{ExportError, Result};
use crate::fetcher::BatchFetcher;
use crate::metrics::METRICS;
use crate::notifier::{download_link, Notifier};
use crate::processors::{run_chain, standard_chain};
use crate::scheduler::JobHandler;

pub struct ExportHandler {
    store: Arc<dyn JobStore>,
    collaborators: Collaborators,
    config: Arc<ExportConfig>,
    fetcher: BatchFetcher,
    notifier: Notifier,
}

impl ExportHandler {
    pub fn new(
        store: Arc<dyn JobStore>,
        collaborators: Collaborators,
        config: Arc<ExportConfig>,
    ) -> Self {
        let fetcher = BatchFetcher::new(collaborators.executions.clone(), config.batch_size);
        let notifier = Notifier::new(
            collaborators.notifications.clone(),
            config.download_base_url.clone(),
        );
        Self {
            store,
            collaborators,
            config,
            fetcher,
            notifier,
        }
    }

    fn owner(&self) -> &str {
        &self.config.node_id
    }

    /// `{job_id}-{attempt}.zip`. The file name carries into the blob name,
    /// so every claim of a job uploads to its own file.
    pub fn staging_path(&self, job: &ExportJob) -> PathBuf {
        self.config
            .staging_dir
            .join(format!("{}-{}.zip", job.id, job.attempts))
    }

    async fn export(&self, job: &ExportJob, staging: &Path) -> Result<ExportJob> {
        let started = Utc::now();
        let expires_at = started + self.config.ttl();
        let context = ArchiveContext {
            job_id: job.id.clone(),
            requested_by: job.requested_by.clone(),
            exported_at: started,
            expires_at,
            download_link: download_link(&self.config.download_base_url, &job.id, &job.account_id),
            format: job.output_format,
        };

        let mut writer = ArchiveWriter::create(staging, context).await?;
        let mut page = 0u32;
        let mut total: i64 = 0;
        loop {
            let mut batch = self
                .fetcher
                .fetch_batch(&job.account_id, &job.query, page)
                .await?;
            if batch.is_empty() {
                if page == 0 {
                    return Err(ExportError::NoExecutions);
                }
                break;
            }

            let stages = standard_chain(&self.collaborators, self.config.log_fetch_concurrency);
            run_chain(&mut batch, stages).await;
            writer.write_batch(&batch).await?;

            let count = batch.top_level_len();
            total += count as i64;
            METRICS.inc_batches_processed();
            METRICS.add_executions_exported(count as u64);
            info!(job_id = %job.id, page, executions = count, "Batch exported");

            self.store
                .renew_lease(&job.id, self.owner(), self.config.export.lease())
                .await?;
            page += 1;
        }

        let archive = writer.finish().await?;
        let file_id = self
            .collaborators
            .blobs
            .upload(&job.account_id, &archive.path)
            .await
            .map_err(ExportError::Upload)?;

        let update = ReadyUpdate {
            file_id: file_id.clone(),
            total_executions: total,
            expires_at: expires_at.timestamp_millis(),
        };
        match self.store.mark_ready(&job.id, self.owner(), update).await {
            Ok(done) => Ok(done),
            Err(e) => {
                self.rollback_upload(&job.id, &file_id).await;
                Err(ExportError::StatusUpdate(e))
            }
        }
    }

    async fn rollback_upload(&self, job_id: &ExportJobId, file_id: &FileId) {
        METRICS.inc_uploads_rolled_back();
        match self.collaborators.blobs.delete(file_id).await {
            Ok(_) => warn!(job_id = %job_id, file_id = %file_id, "Deleted upload of unrecorded export"),
            Err(e) => error!(
                job_id = %job_id,
                file_id = %file_id,
                "Failed to delete upload of unrecorded export: {:#}",
                e
            ),
        }
    }

    /// Retry transient failures until `max_attempts`, otherwise mark FAILED.
    async fn settle_failure(&self, job: &ExportJob, err: ExportError) -> anyhow::Result<()> {
        if err.is_superseded() {
            warn!(job_id = %job.id, attempt = job.attempts, "Job taken over, abandoning attempt: {}", err);
            return Ok(());
        }

        if err.is_retryable() && job.attempts < self.config.max_attempts {
            let delay = i64::try_from(self.config.retry_delay().as_millis()).unwrap_or(i64::MAX);
            warn!(
                job_id = %job.id,
                attempt = job.attempts,
                max_attempts = self.config.max_attempts,
                "Export attempt failed, will retry: {}",
                err
            );
            self.store
                .release(&job.id, self.owner(), now_millis().saturating_add(delay))
                .await
                .context("Failed to release export job for retry")?;
            METRICS.inc_jobs_retried();
            return Ok(());
        }

        let message = if err.is_retryable() {
            format!("Export failed after {} attempts: {}", job.attempts, err)
        } else {
            err.to_string()
        };
        self.fail(job, &message).await
    }

    /// Mark the job FAILED and notify.
    async fn fail(&self, job: &ExportJob, message: &str) -> anyhow::Result<()> {
        error!(job_id = %job.id, account_id = %job.account_id, "{}", message);

        let failed = match self.store.mark_failed(&job.id, self.owner(), message).await {
            Ok(failed) => failed,
            Err(e) if e.is_superseded() => {
                warn!(job_id = %job.id, "Job taken over before it could be marked FAILED: {}", e);
                return Ok(());
            }
            Err(e) => return Err(anyhow::Error::new(e).context("Failed to mark export job FAILED")),
        };
        METRICS.inc_jobs_failed();
        self.notifier.dispatch(&failed).await;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for ExportHandler {
    fn kind(&self) -> ClaimKind {
        ClaimKind::Export
    }

    async fn handle(&self, job: ExportJob) -> anyhow::Result<()> {
        info!(
            job_id = %job.id,
            account_id = %job.account_id,
            attempt = job.attempts,
            "Export started"
        );

        // Earlier claims ended without settling the job (worker crash or
        // lease expiry), so the retry budget is spent.
        if job.attempts > self.config.max_attempts {
            let message = format!(
                "Export failed after {} attempts: no attempt finished before its lease expired",
                job.attempts - 1
            );
            return self.fail(&job, &message).await;
        }

        let staging = self.staging_path(&job);
        let outcome = self.export(&job, &staging).await;

        if let Err(e) = tokio::fs::remove_file(&staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(job_id = %job.id, path = %staging.display(), "Failed to remove staging file: {}", e);
            }
        }

        match outcome {
            Ok(done) => {
                METRICS.inc_jobs_ready();
                info!(
                    job_id = %done.id,
                    total_executions = done.total_executions.unwrap_or(0),
                    "Export ready"
                );
                self.notifier.dispatch(&done).await;
                Ok(())
            }
            Err(e) => self.settle_failure(&job, e).await,
        }
    }
}
