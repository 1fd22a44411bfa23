//! Interfaces to the systems the pipeline reads from and writes to.
//!
//! The pipeline owns none of these; everything it needs arrives through a
//! [`Collaborators`] set built by the caller.

use async_trait::async_trait;
use execport_ids::{AccountId, ActivityId, ExecutionId, FileId, UserGroupId, UserId};
use execport_store::ExecutionQuery;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::model::{Activity, ExecutionRecord, InspectionRecord, InterruptRecord, LogLine};

/// Offset/limit window over an ordered listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGroupName {
    pub id: UserGroupId,
    pub name: String,
}

/// Rendered notification: template id plus placeholder values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationPayload {
    pub template_id: String,
    pub placeholders: BTreeMap<String, String>,
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Top-level executions of `account_id` matching `query`, newest first.
    async fn list_executions(
        &self,
        account_id: &AccountId,
        query: &ExecutionQuery,
        page: PageRequest,
    ) -> anyhow::Result<Vec<ExecutionRecord>>;

    /// Executions of `account_id` by id, in any order; unknown ids and
    /// executions of other accounts are omitted.
    async fn list_by_ids(
        &self,
        account_id: &AccountId,
        ids: &[ExecutionId],
    ) -> anyhow::Result<Vec<ExecutionRecord>>;
}

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Whether `query_by_activity_ids` can take more than one key.
    fn supports_in_query(&self) -> bool;

    async fn query_by_activity_ids(&self, ids: &[ActivityId]) -> anyhow::Result<Vec<LogLine>>;

    async fn query_by_activity_id(&self, id: &ActivityId) -> anyhow::Result<Vec<LogLine>>;
}

#[async_trait]
pub trait InterruptStore: Send + Sync {
    /// Interrupts registered against the executions themselves.
    async fn list_by_execution_ids(
        &self,
        ids: &[ExecutionId],
    ) -> anyhow::Result<Vec<InterruptRecord>>;

    /// Interrupt and retry history recorded on individual state executions.
    async fn list_history_by_node_ids(
        &self,
        node_ids: &[String],
    ) -> anyhow::Result<Vec<InterruptRecord>>;
}

#[async_trait]
pub trait InspectionStore: Send + Sync {
    async fn list_by_execution_ids(
        &self,
        ids: &[ExecutionId],
    ) -> anyhow::Result<Vec<InspectionRecord>>;
}

#[async_trait]
pub trait ActivityStore: Send + Sync {
    async fn list_by_ids(&self, ids: &[ActivityId]) -> anyhow::Result<Vec<Activity>>;
}

#[async_trait]
pub trait UserGroupStore: Send + Sync {
    async fn resolve_names(&self, ids: &[UserGroupId]) -> anyhow::Result<Vec<UserGroupName>>;
}

#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn upload(&self, account_id: &AccountId, path: &Path) -> anyhow::Result<FileId>;

    /// Returns `false` when the file was already gone.
    async fn delete(&self, file_id: &FileId) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait AccountStatus: Send + Sync {
    async fn is_active(&self, account_id: &AccountId) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait NotificationDispatch: Send + Sync {
    async fn send_to_user(
        &self,
        payload: &NotificationPayload,
        user_id: &UserId,
    ) -> anyhow::Result<()>;

    async fn send_to_groups(
        &self,
        payload: &NotificationPayload,
        group_ids: &[UserGroupId],
    ) -> anyhow::Result<()>;
}

/// Everything the pipeline talks to, passed explicitly.
#[derive(Clone)]
pub struct Collaborators {
    pub executions: Arc<dyn ExecutionStore>,
    pub logs: Arc<dyn LogStore>,
    pub interrupts: Arc<dyn InterruptStore>,
    pub inspections: Arc<dyn InspectionStore>,
    pub activities: Arc<dyn ActivityStore>,
    pub user_groups: Arc<dyn UserGroupStore>,
    pub blobs: Arc<dyn BlobStorage>,
    pub accounts: Arc<dyn AccountStatus>,
    pub notifications: Arc<dyn NotificationDispatch>,
}
