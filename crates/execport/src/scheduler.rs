//! Lease-based job iterator.
//!
//! Every node runs the same loop against the shared job store. A tick claims
//! as many jobs as the local pool has free slots, leasing them to this node,
//! and runs each one on its own task. Nothing else coordinates the fleet: a
//! node that dies simply stops renewing, its leases lapse, and another node's
//! next tick picks the jobs up again.

use async_trait::async_trait;
use execport_store::{now_millis, ClaimKind, ExportJob, JobStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::collaborators::AccountStatus;
use crate::config::IteratorConfig;
use crate::metrics::METRICS;

/// Work done for one claimed job.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    fn kind(&self) -> ClaimKind;

    /// Process `job`, which is leased to this node. Errors are logged by the
    /// scheduler and never affect other jobs.
    async fn handle(&self, job: ExportJob) -> anyhow::Result<()>;
}

pub struct Scheduler<H: JobHandler> {
    store: Arc<dyn JobStore>,
    accounts: Arc<dyn AccountStatus>,
    handler: Arc<H>,
    owner: String,
    config: IteratorConfig,
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl<H: JobHandler> Scheduler<H> {
    pub fn new(
        store: Arc<dyn JobStore>,
        accounts: Arc<dyn AccountStatus>,
        handler: Arc<H>,
        owner: impl Into<String>,
        config: IteratorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.pool_size.max(1)));
        Self {
            store,
            accounts,
            handler,
            owner: owner.into(),
            config,
            permits,
            tasks: JoinSet::new(),
        }
    }

    fn kind(&self) -> &'static str {
        self.handler.kind().as_str()
    }

    /// Jobs currently being processed by this scheduler.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// One scheduling pass. Returns the number of jobs dispatched.
    pub async fn tick(&mut self) -> usize {
        self.reap_completed();

        let free = self.permits.available_permits();
        if free == 0 {
            debug!(kind = self.kind(), "Pool full, skipping claim");
            return 0;
        }

        let jobs = match self
            .store
            .claim(self.handler.kind(), &self.owner, self.config.lease(), free)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                METRICS.inc_claim_errors();
                error!(kind = self.kind(), owner = %self.owner, "Claim failed: {}", e);
                return 0;
            }
        };

        let mut dispatched = 0;
        for job in jobs {
            METRICS.inc_jobs_claimed();

            let active = match self.accounts.is_active(&job.account_id).await {
                Ok(active) => active,
                Err(e) => {
                    warn!(
                        job_id = %job.id,
                        account_id = %job.account_id,
                        "Account status unavailable, deferring job: {:#}",
                        e
                    );
                    false
                }
            };
            if !active {
                METRICS.inc_jobs_skipped();
                info!(
                    job_id = %job.id,
                    account_id = %job.account_id,
                    "Account inactive, releasing job"
                );
                self.give_back(&job, self.config.interval()).await;
                continue;
            }

            let permit = match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.give_back(&job, Duration::ZERO).await;
                    continue;
                }
            };

            let handler = self.handler.clone();
            let kind = self.kind();
            self.tasks.spawn(async move {
                let _permit = permit;
                let job_id = job.id.clone();
                if let Err(e) = handler.handle(job).await {
                    error!(job_id = %job_id, kind, "Job handler failed: {:#}", e);
                }
            });
            dispatched += 1;
        }

        if dispatched > 0 {
            debug!(kind = self.kind(), dispatched, in_flight = self.tasks.len(), "Tick dispatched jobs");
        }
        dispatched
    }

    /// Release a claimed job without processing it.
    async fn give_back(&self, job: &ExportJob, delay: Duration) {
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let next = now_millis().saturating_add(delay_ms);
        if let Err(e) = self.store.release(&job.id, &self.owner, next).await {
            warn!(job_id = %job.id, "Failed to release job: {}", e);
        }
    }

    fn reap_completed(&mut self) {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(e) = joined {
                error!(kind = self.kind(), "Job task panicked: {}", e);
            }
        }
    }

    /// Wait for every in-flight job to finish.
    pub async fn drain(&mut self) {
        if !self.tasks.is_empty() {
            info!(kind = self.kind(), jobs = self.tasks.len(), "Waiting for in-flight jobs");
        }
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(kind = self.kind(), "Job task panicked: {}", e);
            }
        }
    }

    /// Tick every `interval` until `shutdown` flips, then drain.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            kind = self.kind(),
            owner = %self.owner,
            interval_secs = self.config.interval_secs,
            pool_size = self.config.pool_size,
            "Scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // sender dropped
                        break;
                    }
                }

                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        self.drain().await;
        info!(kind = self.kind(), "Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use execport_ids::{AccountId, UserId};
    use execport_store::{
        ExecutionQuery, ExportStatus, NewExportJob, NotifyTarget, OutputFormat, Requester,
        SqliteJobStore,
    };
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct Accounts(HashSet<String>);

    #[async_trait]
    impl AccountStatus for Accounts {
        async fn is_active(&self, account_id: &AccountId) -> anyhow::Result<bool> {
            Ok(!self.0.contains(account_id.as_str()))
        }
    }

    /// Records jobs and then fails them so they leave the QUEUED set.
    struct Recording {
        store: Arc<dyn JobStore>,
        owner: String,
        seen: Mutex<Vec<String>>,
        panic_on: Option<String>,
    }

    #[async_trait]
    impl JobHandler for Recording {
        fn kind(&self) -> ClaimKind {
            ClaimKind::Export
        }

        async fn handle(&self, job: ExportJob) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(job.account_id.to_string());
            if self.panic_on.as_deref() == Some(job.account_id.as_str()) {
                panic!("handler blew up");
            }
            self.store.mark_failed(&job.id, &self.owner, "done").await?;
            Ok(())
        }
    }

    fn new_job(account: &str) -> NewExportJob {
        NewExportJob {
            account_id: AccountId::from(account),
            query: ExecutionQuery::default(),
            output_format: OutputFormat::Json,
            notify_target: NotifyTarget::None,
            requested_by: Requester {
                id: UserId::from("u1"),
                name: "Ada".to_string(),
                email: None,
            },
        }
    }

    fn iterator(pool_size: usize) -> IteratorConfig {
        IteratorConfig {
            interval_secs: 60,
            lease_secs: 60,
            pool_size,
        }
    }

    async fn setup(
        inactive: &[&str],
        panic_on: Option<&str>,
        pool_size: usize,
    ) -> (Arc<SqliteJobStore>, Arc<Recording>, Scheduler<Recording>) {
        let store = Arc::new(SqliteJobStore::open_in_memory().await.unwrap());
        let handler = Arc::new(Recording {
            store: store.clone(),
            owner: "node-a".to_string(),
            seen: Mutex::new(Vec::new()),
            panic_on: panic_on.map(str::to_string),
        });
        let accounts = Arc::new(Accounts(inactive.iter().map(|s| s.to_string()).collect()));
        let scheduler = Scheduler::new(
            store.clone(),
            accounts,
            handler.clone(),
            "node-a",
            iterator(pool_size),
        );
        (store, handler, scheduler)
    }

    #[tokio::test]
    async fn test_tick_dispatches_up_to_pool_size() {
        let (store, handler, mut scheduler) = setup(&[], None, 2).await;
        for _ in 0..3 {
            store.insert(new_job("acct")).await.unwrap();
        }

        assert_eq!(scheduler.tick().await, 2);
        scheduler.drain().await;
        assert_eq!(scheduler.tick().await, 1);
        scheduler.drain().await;

        assert_eq!(handler.seen.lock().unwrap().len(), 3);
        assert_eq!(store.stats().await.unwrap().failed, 3);
    }

    #[tokio::test]
    async fn test_inactive_account_is_released_not_processed() {
        let (store, handler, mut scheduler) = setup(&["frozen"], None, 3).await;
        let frozen = store.insert(new_job("frozen")).await.unwrap();
        store.insert(new_job("live")).await.unwrap();

        assert_eq!(scheduler.tick().await, 1);
        scheduler.drain().await;

        assert_eq!(*handler.seen.lock().unwrap(), vec!["live".to_string()]);
        let frozen = store.get(&frozen.id).await.unwrap().unwrap();
        assert_eq!(frozen.status, ExportStatus::Queued);
        assert!(frozen.lease.is_none());
        assert!(frozen.next_iteration > now_millis());
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_stop_others() {
        let (store, handler, mut scheduler) = setup(&[], Some("bad"), 3).await;
        store.insert(new_job("bad")).await.unwrap();
        store.insert(new_job("good")).await.unwrap();

        assert_eq!(scheduler.tick().await, 2);
        scheduler.drain().await;

        assert_eq!(handler.seen.lock().unwrap().len(), 2);
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        // the panicked job keeps its lease until it lapses
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.leased, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (store, handler, scheduler) = setup(&[], None, 1).await;
        store.insert(new_job("acct")).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(scheduler.run(rx));

        // the first tick fires immediately
        for _ in 0..50 {
            if !handler.seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        running.await.unwrap();

        assert_eq!(handler.seen.lock().unwrap().len(), 1);
    }
}
