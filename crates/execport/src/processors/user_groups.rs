//! Approval user-group names.

use async_trait::async_trait;
use execport_ids::UserGroupId;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use super::ExecutionProcessor;
use crate::collaborators::UserGroupStore;
use crate::model::{Batch, ExecutionRecord};

pub struct UserGroupProcessor {
    store: Arc<dyn UserGroupStore>,
    group_ids: BTreeSet<UserGroupId>,
}

impl UserGroupProcessor {
    pub fn new(store: Arc<dyn UserGroupStore>) -> Self {
        Self {
            store,
            group_ids: BTreeSet::new(),
        }
    }
}

#[async_trait]
impl ExecutionProcessor for UserGroupProcessor {
    fn name(&self) -> &'static str {
        "user_groups"
    }

    fn visit(&mut self, record: &ExecutionRecord) {
        let ids = record
            .nodes
            .iter()
            .filter_map(|n| n.approval.as_ref())
            .flat_map(|a| a.user_group_ids.iter().cloned());
        self.group_ids.extend(ids);
    }

    async fn process(&mut self, batch: &mut Batch) -> anyhow::Result<()> {
        if self.group_ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<UserGroupId> = self.group_ids.iter().cloned().collect();
        let names: HashMap<UserGroupId, String> = self
            .store
            .resolve_names(&ids)
            .await?
            .into_iter()
            .map(|g| (g.id, g.name))
            .collect();

        for (_, node) in batch.nodes_mut() {
            if let Some(approval) = node.approval.as_mut() {
                // Groups deleted since the approval keep their id in the summary.
                approval.user_group_names = approval
                    .user_group_ids
                    .iter()
                    .filter_map(|id| names.get(id).cloned())
                    .collect();
            }
        }
        Ok(())
    }
}
