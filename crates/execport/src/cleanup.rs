//! Purges READY archives whose TTL has passed.

use async_trait::async_trait;
use execport_store::{now_millis, ClaimKind, ExportJob, JobStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::collaborators::BlobStorage;
use crate::metrics::METRICS;
use crate::scheduler::JobHandler;

pub struct CleanupHandler {
    store: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStorage>,
    owner: String,
    retry_after: Duration,
}

impl CleanupHandler {
    pub fn new(
        store: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStorage>,
        owner: impl Into<String>,
        retry_after: Duration,
    ) -> Self {
        Self {
            store,
            blobs,
            owner: owner.into(),
            retry_after,
        }
    }
}

#[async_trait]
impl JobHandler for CleanupHandler {
    fn kind(&self) -> ClaimKind {
        ClaimKind::Cleanup
    }

    async fn handle(&self, job: ExportJob) -> anyhow::Result<()> {
        if let Some(file_id) = &job.file_id {
            match self.blobs.delete(file_id).await {
                Ok(true) => info!(job_id = %job.id, file_id = %file_id, "Deleted expired archive"),
                Ok(false) => debug!(job_id = %job.id, file_id = %file_id, "Archive already gone"),
                Err(e) => {
                    warn!(job_id = %job.id, file_id = %file_id, "Failed to delete archive, will retry: {:#}", e);
                    let delay = i64::try_from(self.retry_after.as_millis()).unwrap_or(i64::MAX);
                    self.store
                        .release(&job.id, &self.owner, now_millis().saturating_add(delay))
                        .await?;
                    return Ok(());
                }
            }
        }

        self.store.mark_expired(&job.id, &self.owner).await?;
        METRICS.inc_jobs_expired();
        info!(job_id = %job.id, account_id = %job.account_id, "Export expired");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use execport_ids::{AccountId, FileId, UserId};
    use execport_store::{
        ExecutionQuery, ExportStatus, NewExportJob, NotifyTarget, OutputFormat, ReadyUpdate,
        Requester, SqliteJobStore,
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct Blobs {
        present: AtomicBool,
        broken: bool,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl BlobStorage for Blobs {
        async fn upload(
            &self,
            _account_id: &AccountId,
            _path: &std::path::Path,
        ) -> anyhow::Result<FileId> {
            anyhow::bail!("not used")
        }

        async fn delete(&self, _file_id: &FileId) -> anyhow::Result<bool> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            if self.broken {
                anyhow::bail!("storage offline");
            }
            Ok(self.present.swap(false, Ordering::SeqCst))
        }
    }

    async fn expired_ready_job(store: &SqliteJobStore) -> ExportJob {
        let job = store
            .insert(NewExportJob {
                account_id: AccountId::from("acct"),
                query: ExecutionQuery::default(),
                output_format: OutputFormat::Json,
                notify_target: NotifyTarget::None,
                requested_by: Requester {
                    id: UserId::from("u1"),
                    name: "Ada".to_string(),
                    email: None,
                },
            })
            .await
            .unwrap();
        store
            .claim(ClaimKind::Export, "exporter", Duration::from_secs(60), 1)
            .await
            .unwrap();
        store
            .mark_ready(
                &job.id,
                "exporter",
                ReadyUpdate {
                    file_id: FileId::from("acct/archive.zip"),
                    total_executions: 1,
                    expires_at: now_millis() - 1_000,
                },
            )
            .await
            .unwrap();
        let mut claimed = store
            .claim(ClaimKind::Cleanup, "sweeper", Duration::from_secs(60), 1)
            .await
            .unwrap();
        claimed.remove(0)
    }

    fn handler(store: Arc<SqliteJobStore>, blobs: Arc<Blobs>) -> CleanupHandler {
        CleanupHandler::new(store, blobs, "sweeper", Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_expires_after_delete() {
        let store = Arc::new(SqliteJobStore::open_in_memory().await.unwrap());
        let job = expired_ready_job(&store).await;
        let blobs = Arc::new(Blobs {
            present: AtomicBool::new(true),
            broken: false,
            deletes: AtomicUsize::new(0),
        });

        handler(store.clone(), blobs.clone()).handle(job.clone()).await.unwrap();

        let after = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(after.status, ExportStatus::Expired);
        assert!(after.file_id.is_none());
        assert_eq!(blobs.deletes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_not_an_error() {
        let store = Arc::new(SqliteJobStore::open_in_memory().await.unwrap());
        let job = expired_ready_job(&store).await;
        let blobs = Arc::new(Blobs {
            present: AtomicBool::new(false),
            broken: false,
            deletes: AtomicUsize::new(0),
        });

        handler(store.clone(), blobs).handle(job.clone()).await.unwrap();
        let after = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(after.status, ExportStatus::Expired);
    }

    #[tokio::test]
    async fn test_storage_error_releases_for_retry() {
        let store = Arc::new(SqliteJobStore::open_in_memory().await.unwrap());
        let job = expired_ready_job(&store).await;
        let blobs = Arc::new(Blobs {
            present: AtomicBool::new(true),
            broken: true,
            deletes: AtomicUsize::new(0),
        });

        handler(store.clone(), blobs).handle(job.clone()).await.unwrap();
        let after = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(after.status, ExportStatus::Ready);
        assert!(after.lease.is_none());

        // not due again until the retry delay has passed
        let again = store
            .claim(ClaimKind::Cleanup, "sweeper", Duration::from_secs(60), 1)
            .await
            .unwrap();
        assert!(again.is_empty());
    }
}
