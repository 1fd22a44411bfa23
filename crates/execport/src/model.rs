//! In-memory execution records and the per-page batch arena.
//!
//! Records are owned by a [`Batch`]; pipeline stages refer to their resolved
//! sub-executions by arena index, so parent/child links never form object
//! cycles.

use execport_ids::{AccountId, ActivityId, ExecutionId, UserGroupId};
use execport_store::ExecutionKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// One workflow or pipeline execution, as read from the execution store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub account_id: AccountId,
    pub application_id: String,
    #[serde(default)]
    pub application_name: Option<String>,
    pub entity_name: String,
    pub kind: ExecutionKind,
    pub status: String,
    #[serde(default)]
    pub triggered_by: Option<String>,
    pub created_at: i64,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub ended_at: Option<i64>,
    /// Set on sub-executions; points back at the pipeline that spawned it.
    #[serde(default)]
    pub parent_id: Option<ExecutionId>,
    #[serde(default)]
    pub stages: Vec<PipelineStage>,
    #[serde(default)]
    pub nodes: Vec<ExecutionDetail>,
    /// Interrupts raised against the execution as a whole.
    #[serde(default)]
    pub interrupts: Vec<InterruptRecord>,
}

impl ExecutionRecord {
    /// Start time used in folder names; falls back to creation time.
    pub fn start_time(&self) -> i64 {
        self.started_at.unwrap_or(self.created_at)
    }

    pub fn display_application(&self) -> &str {
        self.application_name
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.application_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub sub_execution_id: Option<ExecutionId>,
    /// Arena index of the resolved sub-execution.
    #[serde(skip)]
    pub resolved: Option<usize>,
}

/// Per-node graph metadata. Each processor stage owns a disjoint subset of
/// these fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionDetail {
    pub node_id: String,
    pub name: String,
    pub node_type: String,
    pub status: String,
    #[serde(default)]
    pub activity_id: Option<ActivityId>,
    #[serde(default)]
    pub approval: Option<ApprovalDetail>,
    #[serde(default)]
    pub sub_commands: Vec<SubCommand>,
    #[serde(default)]
    pub interrupts: Vec<InterruptRecord>,
    /// Variable snapshot captured by state inspection.
    #[serde(default)]
    pub execution_context: BTreeMap<String, serde_json::Value>,
    /// Raw log lines; written as separate archive entries, never into the summary.
    #[serde(skip)]
    pub logs: Vec<LogLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDetail {
    #[serde(default)]
    pub user_group_ids: Vec<UserGroupId>,
    #[serde(default)]
    pub user_group_names: Vec<String>,
    #[serde(default)]
    pub approved_by: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubCommand {
    pub name: String,
    #[serde(default)]
    pub command_units: Vec<CommandUnit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandUnit {
    pub name: String,
    pub status: String,
}

/// Interrupt or retry event. `created_at` is the effect time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterruptRecord {
    pub id: String,
    pub execution_id: ExecutionId,
    /// `None` for execution-level interrupts.
    #[serde(default)]
    pub node_id: Option<String>,
    pub interrupt_type: String,
    pub state: String,
    pub created_at: i64,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionRecord {
    pub execution_id: ExecutionId,
    pub node_id: String,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
}

/// Command structure of one activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    #[serde(default)]
    pub commands: Vec<SubCommand>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub activity_id: ActivityId,
    pub command_unit: String,
    pub timestamp: i64,
    #[serde(default = "default_log_level")]
    pub level: String,
    pub message: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

/// One page of top-level records plus every sub-execution they reference.
///
/// Top-level records occupy the first `top_level` slots in fetch order;
/// resolved sub-executions are appended after them.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    page: u32,
    records: Vec<ExecutionRecord>,
    top_level: usize,
    index: HashMap<ExecutionId, usize>,
}

impl Batch {
    pub fn new(page: u32, records: Vec<ExecutionRecord>) -> Self {
        let top_level = records.len();
        let index = records
            .iter()
            .enumerate()
            .map(|(idx, r)| (r.id.clone(), idx))
            .collect();
        Self {
            page,
            records,
            top_level,
            index,
        }
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn is_empty(&self) -> bool {
        self.top_level == 0
    }

    pub fn top_level_len(&self) -> usize {
        self.top_level
    }

    /// Top-level records, in fetch order.
    pub fn top_level(&self) -> &[ExecutionRecord] {
        &self.records[..self.top_level]
    }

    /// Every record in the arena, sub-executions included.
    pub fn records(&self) -> &[ExecutionRecord] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [ExecutionRecord] {
        &mut self.records
    }

    pub fn get(&self, idx: usize) -> Option<&ExecutionRecord> {
        self.records.get(idx)
    }

    pub fn index_of(&self, id: &ExecutionId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Add a sub-execution; returns the existing slot if it is already present.
    pub fn insert_sub_execution(&mut self, record: ExecutionRecord) -> usize {
        if let Some(idx) = self.index.get(&record.id) {
            return *idx;
        }
        let idx = self.records.len();
        self.index.insert(record.id.clone(), idx);
        self.records.push(record);
        idx
    }

    /// Stage references that do not point at a record in the arena.
    pub fn unresolved_refs(&self) -> Vec<ExecutionId> {
        self.records
            .iter()
            .flat_map(|r| r.stages.iter())
            .filter_map(|stage| match (&stage.sub_execution_id, stage.resolved) {
                (Some(id), Some(idx)) if self.records.get(idx).map(|r| &r.id) == Some(id) => None,
                (Some(id), _) => Some(id.clone()),
                (None, _) => None,
            })
            .collect()
    }

    /// Every node in the arena together with the id of its owning execution.
    pub fn nodes_mut(&mut self) -> impl Iterator<Item = (&ExecutionId, &mut ExecutionDetail)> {
        self.records.iter_mut().flat_map(|r| {
            let ExecutionRecord { id, nodes, .. } = r;
            let id: &ExecutionId = id;
            nodes.iter_mut().map(move |n| (id, n))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> ExecutionRecord {
        ExecutionRecord {
            id: ExecutionId::from(id),
            account_id: AccountId::from("acct"),
            application_id: "app".to_string(),
            application_name: None,
            entity_name: "deploy".to_string(),
            kind: ExecutionKind::Workflow,
            status: "SUCCESS".to_string(),
            triggered_by: None,
            created_at: 0,
            started_at: None,
            ended_at: None,
            parent_id: None,
            stages: Vec::new(),
            nodes: Vec::new(),
            interrupts: Vec::new(),
        }
    }

    #[test]
    fn test_insert_sub_execution_dedups() {
        let mut batch = Batch::new(0, vec![record("a")]);
        let first = batch.insert_sub_execution(record("b"));
        let again = batch.insert_sub_execution(record("b"));
        let top = batch.insert_sub_execution(record("a"));

        assert_eq!(first, 1);
        assert_eq!(again, 1);
        assert_eq!(top, 0);
        assert_eq!(batch.top_level_len(), 1);
        assert_eq!(batch.records().len(), 2);
    }

    #[test]
    fn test_unresolved_refs() {
        let mut pipeline = record("p");
        pipeline.kind = ExecutionKind::Pipeline;
        pipeline.stages.push(PipelineStage {
            name: "build".to_string(),
            status: "SUCCESS".to_string(),
            sub_execution_id: Some(ExecutionId::from("w")),
            resolved: None,
        });
        let mut batch = Batch::new(0, vec![pipeline]);
        assert_eq!(batch.unresolved_refs(), vec![ExecutionId::from("w")]);

        let idx = batch.insert_sub_execution(record("w"));
        batch.records_mut()[0].stages[0].resolved = Some(idx);
        assert!(batch.unresolved_refs().is_empty());
    }

    #[test]
    fn test_display_application_falls_back_to_id() {
        let mut r = record("a");
        assert_eq!(r.display_application(), "app");
        r.application_name = Some("Payments".to_string());
        assert_eq!(r.display_application(), "Payments");
    }
}
