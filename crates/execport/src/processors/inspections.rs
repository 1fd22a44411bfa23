//! State-inspection variable snapshots.

use async_trait::async_trait;
use execport_ids::ExecutionId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use super::ExecutionProcessor;
use crate::collaborators::InspectionStore;
use crate::model::{Batch, ExecutionRecord};

pub struct InspectionProcessor {
    store: Arc<dyn InspectionStore>,
    execution_ids: BTreeSet<ExecutionId>,
}

impl InspectionProcessor {
    pub fn new(store: Arc<dyn InspectionStore>) -> Self {
        Self {
            store,
            execution_ids: BTreeSet::new(),
        }
    }
}

#[async_trait]
impl ExecutionProcessor for InspectionProcessor {
    fn name(&self) -> &'static str {
        "inspections"
    }

    fn visit(&mut self, record: &ExecutionRecord) {
        if !record.nodes.is_empty() {
            self.execution_ids.insert(record.id.clone());
        }
    }

    async fn process(&mut self, batch: &mut Batch) -> anyhow::Result<()> {
        if self.execution_ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<ExecutionId> = self.execution_ids.iter().cloned().collect();
        let mut snapshots: HashMap<(ExecutionId, String), BTreeMap<String, serde_json::Value>> =
            HashMap::new();
        for inspection in self.store.list_by_execution_ids(&ids).await? {
            snapshots
                .entry((inspection.execution_id, inspection.node_id))
                .or_default()
                .extend(inspection.variables);
        }

        for (execution_id, node) in batch.nodes_mut() {
            if let Some(vars) = snapshots.remove(&(execution_id.clone(), node.node_id.clone())) {
                node.execution_context = vars;
            }
        }
        Ok(())
    }
}
