//! Activity command structure (sub-commands and their command units).

use async_trait::async_trait;
use execport_ids::ActivityId;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::ExecutionProcessor;
use crate::collaborators::ActivityStore;
use crate::model::{Batch, ExecutionRecord, SubCommand};

pub struct SubCommandProcessor {
    store: Arc<dyn ActivityStore>,
    activity_ids: BTreeSet<ActivityId>,
}

impl SubCommandProcessor {
    pub fn new(store: Arc<dyn ActivityStore>) -> Self {
        Self {
            store,
            activity_ids: BTreeSet::new(),
        }
    }
}

#[async_trait]
impl ExecutionProcessor for SubCommandProcessor {
    fn name(&self) -> &'static str {
        "sub_commands"
    }

    fn visit(&mut self, record: &ExecutionRecord) {
        let ids = record.nodes.iter().filter_map(|n| n.activity_id.clone());
        self.activity_ids.extend(ids);
    }

    async fn process(&mut self, batch: &mut Batch) -> anyhow::Result<()> {
        if self.activity_ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<ActivityId> = self.activity_ids.iter().cloned().collect();
        let commands: HashMap<ActivityId, Vec<SubCommand>> = self
            .store
            .list_by_ids(&ids)
            .await?
            .into_iter()
            .map(|a| (a.id, a.commands))
            .collect();

        for (_, node) in batch.nodes_mut() {
            let found = node.activity_id.as_ref().and_then(|id| commands.get(id));
            if let Some(found) = found {
                node.sub_commands = found.clone();
            }
        }
        Ok(())
    }
}
