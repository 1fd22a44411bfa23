//! Raw log lines per activity.

use anyhow::anyhow;
use async_trait::async_trait;
use execport_ids::ActivityId;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use super::ExecutionProcessor;
use crate::collaborators::LogStore;
use crate::model::{Batch, ExecutionRecord, LogLine};

pub struct LogProcessor {
    store: Arc<dyn LogStore>,
    concurrency: usize,
    activity_ids: BTreeSet<ActivityId>,
}

impl LogProcessor {
    pub fn new(store: Arc<dyn LogStore>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
            activity_ids: BTreeSet::new(),
        }
    }

    /// One query per activity, at most `concurrency` in flight. Lines from
    /// activities that could be read are kept even when others fail.
    async fn fetch_each(&self, ids: Vec<ActivityId>) -> (Vec<LogLine>, Option<anyhow::Error>) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for id in ids {
            let store = self.store.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| anyhow!("log fetch pool closed: {}", e))?;
                store.query_by_activity_id(&id).await
            });
        }

        let mut lines = Vec::new();
        let mut failed = 0usize;
        let mut last_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(found)) => lines.extend(found),
                Ok(Err(e)) => {
                    failed += 1;
                    last_error = Some(e);
                }
                Err(e) => {
                    failed += 1;
                    last_error = Some(anyhow!("log fetch task failed: {}", e));
                }
            }
        }

        let error = last_error.map(|e| e.context(format!("{} activity log queries failed", failed)));
        (lines, error)
    }
}

#[async_trait]
impl ExecutionProcessor for LogProcessor {
    fn name(&self) -> &'static str {
        "logs"
    }

    fn visit(&mut self, record: &ExecutionRecord) {
        let ids = record.nodes.iter().filter_map(|n| n.activity_id.clone());
        self.activity_ids.extend(ids);
    }

    async fn process(&mut self, batch: &mut Batch) -> anyhow::Result<()> {
        if self.activity_ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<ActivityId> = std::mem::take(&mut self.activity_ids).into_iter().collect();

        let (mut lines, error) = if self.store.supports_in_query() {
            (self.store.query_by_activity_ids(&ids).await?, None)
        } else {
            debug!(activities = ids.len(), "Log store lacks IN queries, fetching per activity");
            self.fetch_each(ids).await
        };

        lines.sort_by(|a, b| {
            a.activity_id
                .cmp(&b.activity_id)
                .then(a.timestamp.cmp(&b.timestamp))
                .then_with(|| a.command_unit.cmp(&b.command_unit))
                .then_with(|| a.message.cmp(&b.message))
        });

        let mut by_activity: HashMap<ActivityId, Vec<LogLine>> = HashMap::new();
        for line in lines {
            by_activity
                .entry(line.activity_id.clone())
                .or_default()
                .push(line);
        }

        for (_, node) in batch.nodes_mut() {
            let Some(activity_id) = node.activity_id.as_ref() else {
                continue;
            };
            // Two nodes may share an activity; each gets its own copy.
            if let Some(found) = by_activity.get(activity_id) {
                node.logs = found.clone();
            }
        }

        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
