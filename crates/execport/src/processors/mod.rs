//! Enrichment stages applied to every batch before it is archived.
//!
//! Each stage first sees every record through [`ExecutionProcessor::visit`]
//! to collect the keys it needs, then makes one bulk call in
//! [`ExecutionProcessor::process`] and back-fills the fields it owns. Stages
//! run in a fixed order and a failing stage only degrades its own fields.

mod inspections;
mod interrupts;
mod log_client;
mod logs;
mod sub_commands;
mod user_groups;

pub use inspections::InspectionProcessor;
pub use interrupts::{merge_interrupts, InterruptProcessor};
pub use log_client::{IssuedLogClient, LogClientFactory, RefreshingLogStore};
pub use logs::LogProcessor;
pub use sub_commands::SubCommandProcessor;
pub use user_groups::UserGroupProcessor;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::collaborators::Collaborators;
use crate::metrics::METRICS;
use crate::model::{Batch, ExecutionRecord};

#[async_trait]
pub trait ExecutionProcessor: Send {
    fn name(&self) -> &'static str;

    /// Record what this stage needs from `record`. Called once per arena record.
    fn visit(&mut self, record: &ExecutionRecord);

    /// One bulk fetch, then back-fill.
    async fn process(&mut self, batch: &mut Batch) -> anyhow::Result<()>;
}

/// The stage list for one batch, in execution order. Log lines come last.
pub fn standard_chain(
    collaborators: &Collaborators,
    log_fetch_concurrency: usize,
) -> Vec<Box<dyn ExecutionProcessor>> {
    vec![
        Box::new(UserGroupProcessor::new(collaborators.user_groups.clone())),
        Box::new(InspectionProcessor::new(collaborators.inspections.clone())),
        Box::new(InterruptProcessor::new(collaborators.interrupts.clone())),
        Box::new(SubCommandProcessor::new(collaborators.activities.clone())),
        Box::new(LogProcessor::new(
            collaborators.logs.clone(),
            log_fetch_concurrency,
        )),
    ]
}

/// Run `stages` over `batch` in order. Returns the number of stages that failed.
pub async fn run_chain(batch: &mut Batch, stages: Vec<Box<dyn ExecutionProcessor>>) -> usize {
    let mut failures = 0;
    for mut stage in stages {
        for record in batch.records() {
            stage.visit(record);
        }
        match stage.process(batch).await {
            Ok(()) => debug!(stage = stage.name(), page = batch.page(), "Stage complete"),
            Err(e) => {
                failures += 1;
                METRICS.inc_stage_failures();
                warn!(
                    stage = stage.name(),
                    page = batch.page(),
                    "Stage failed, continuing without its data: {:#}",
                    e
                );
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recording {
        name: &'static str,
        fail: bool,
        visited: usize,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ExecutionProcessor for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        fn visit(&mut self, _record: &ExecutionRecord) {
            self.visited += 1;
        }

        async fn process(&mut self, _batch: &mut Batch) -> anyhow::Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, self.visited));
            if self.fail {
                anyhow::bail!("{} unavailable", self.name);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_stage_does_not_block_later_stages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stage = |name, fail| -> Box<dyn ExecutionProcessor> {
            Box::new(Recording {
                name,
                fail,
                visited: 0,
                log: log.clone(),
            })
        };
        let mut batch = Batch::new(0, Vec::new());

        let failures = run_chain(
            &mut batch,
            vec![stage("first", false), stage("second", true), stage("third", false)],
        )
        .await;

        assert_eq!(failures, 1);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:0", "second:0", "third:0"]
        );
    }
}
