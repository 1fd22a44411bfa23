//! Interrupt and retry history.
//!
//! Two sources overlap: interrupts registered on the execution (some scoped
//! to a node) and the history kept on each state execution. Both are merged
//! into the owning list, de-duplicated by interrupt id.

use async_trait::async_trait;
use execport_ids::ExecutionId;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use super::ExecutionProcessor;
use crate::collaborators::InterruptStore;
use crate::model::{Batch, ExecutionRecord, InterruptRecord};

pub struct InterruptProcessor {
    store: Arc<dyn InterruptStore>,
    execution_ids: BTreeSet<ExecutionId>,
    node_ids: BTreeSet<String>,
}

impl InterruptProcessor {
    pub fn new(store: Arc<dyn InterruptStore>) -> Self {
        Self {
            store,
            execution_ids: BTreeSet::new(),
            node_ids: BTreeSet::new(),
        }
    }
}

/// Append `incoming` to `existing`, drop repeated ids, and sort by effect
/// time (ties broken by id).
pub fn merge_interrupts(existing: &mut Vec<InterruptRecord>, incoming: Vec<InterruptRecord>) {
    existing.extend(incoming);
    let mut seen = HashSet::new();
    existing.retain(|i| seen.insert(i.id.clone()));
    existing.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

#[async_trait]
impl ExecutionProcessor for InterruptProcessor {
    fn name(&self) -> &'static str {
        "interrupts"
    }

    fn visit(&mut self, record: &ExecutionRecord) {
        self.execution_ids.insert(record.id.clone());
        self.node_ids
            .extend(record.nodes.iter().map(|n| n.node_id.clone()));
    }

    async fn process(&mut self, batch: &mut Batch) -> anyhow::Result<()> {
        if self.execution_ids.is_empty() {
            return Ok(());
        }
        let execution_ids: Vec<ExecutionId> = self.execution_ids.iter().cloned().collect();
        let mut found = self.store.list_by_execution_ids(&execution_ids).await?;

        if !self.node_ids.is_empty() {
            let node_ids: Vec<String> = self.node_ids.iter().cloned().collect();
            found.extend(self.store.list_history_by_node_ids(&node_ids).await?);
        }

        let mut by_execution: HashMap<ExecutionId, Vec<InterruptRecord>> = HashMap::new();
        let mut by_node: HashMap<(ExecutionId, String), Vec<InterruptRecord>> = HashMap::new();
        for interrupt in found {
            match interrupt.node_id.clone() {
                Some(node_id) => by_node
                    .entry((interrupt.execution_id.clone(), node_id))
                    .or_default()
                    .push(interrupt),
                None => by_execution
                    .entry(interrupt.execution_id.clone())
                    .or_default()
                    .push(interrupt),
            }
        }

        for record in batch.records_mut() {
            if let Some(incoming) = by_execution.remove(&record.id) {
                merge_interrupts(&mut record.interrupts, incoming);
            }
        }
        for (execution_id, node) in batch.nodes_mut() {
            if let Some(incoming) = by_node.remove(&(execution_id.clone(), node.node_id.clone())) {
                merge_interrupts(&mut node.interrupts, incoming);
            }
        }
        Ok(())
    }
}
