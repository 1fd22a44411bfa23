//! File-backed collaborators for single-host deployments and tests.

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use execport_ids::{AccountId, ActivityId, ExecutionId, FileId, UserGroupId, UserId};
use execport_store::ExecutionQuery;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::collaborators::{
    AccountStatus, ActivityStore, BlobStorage, Collaborators, ExecutionStore, InspectionStore,
    InterruptStore, LogStore, NotificationDispatch, NotificationPayload, PageRequest,
    UserGroupName, UserGroupStore,
};
use crate::model::{Activity, ExecutionRecord, InspectionRecord, InterruptRecord, LogLine};
use crate::processors::{IssuedLogClient, LogClientFactory};

/// Blob storage in a local directory. Files are stored as
/// `{root}/{account}/{file name}`, so re-uploading the same staging file
/// replaces the previous copy.
pub struct LocalBlobStorage {
    root: PathBuf,
}

impl LocalBlobStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a file id under the root, refusing anything that escapes it.
    pub fn path_of(&self, file_id: &FileId) -> anyhow::Result<PathBuf> {
        let relative = Path::new(file_id.as_str());
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("Invalid file id: {}", file_id);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStorage for LocalBlobStorage {
    async fn upload(&self, account_id: &AccountId, path: &Path) -> anyhow::Result<FileId> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("Upload source has no file name: {}", path.display()))?;
        let file_id = FileId::parse(&format!("{}/{}", account_id, file_name))?;
        let target = self.path_of(&file_id)?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let bytes = tokio::fs::copy(path, &target)
            .await
            .with_context(|| format!("Failed to copy archive to {}", target.display()))?;
        info!(file_id = %file_id, bytes, "Archive stored");
        Ok(file_id)
    }

    async fn delete(&self, file_id: &FileId) -> anyhow::Result<bool> {
        let target = self.path_of(file_id)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", target.display())),
        }
    }
}

/// Execution history loaded from one JSON document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub executions: Vec<ExecutionRecord>,
    pub logs: Vec<LogLine>,
    pub interrupts: Vec<InterruptRecord>,
    pub interrupt_history: Vec<InterruptRecord>,
    pub inspections: Vec<InspectionRecord>,
    pub activities: Vec<Activity>,
    pub user_groups: Vec<UserGroupName>,
    /// Emulate a log backend without multi-key queries.
    pub single_key_logs: bool,
}

/// Read-only stores served from a [`Snapshot`].
pub struct SnapshotSource {
    snapshot: Snapshot,
}

impl SnapshotSource {
    pub fn new(snapshot: Snapshot) -> Self {
        Self { snapshot }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_str(&content)
            .with_context(|| format!("Invalid snapshot: {}", path.display()))?;
        Ok(Self::new(snapshot))
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }
}

/// Whether `record` satisfies every populated filter in `query`.
pub fn matches_query(record: &ExecutionRecord, query: &ExecutionQuery) -> bool {
    if !query.application_ids.is_empty() && !query.application_ids.contains(&record.application_id)
    {
        return false;
    }
    if !query.kinds.is_empty() && !query.kinds.contains(&record.kind) {
        return false;
    }
    if !query.statuses.is_empty()
        && !query
            .statuses
            .iter()
            .any(|s| s.eq_ignore_ascii_case(&record.status))
    {
        return false;
    }
    if query.created_after.is_some_and(|after| record.created_at < after) {
        return false;
    }
    if query.created_before.is_some_and(|before| record.created_at >= before) {
        return false;
    }
    if let Some(user) = &query.triggered_by {
        if record.triggered_by.as_ref() != Some(user) {
            return false;
        }
    }
    if !query.execution_ids.is_empty() && !query.execution_ids.contains(&record.id) {
        return false;
    }
    true
}

#[async_trait]
impl ExecutionStore for SnapshotSource {
    async fn list_executions(
        &self,
        account_id: &AccountId,
        query: &ExecutionQuery,
        page: PageRequest,
    ) -> anyhow::Result<Vec<ExecutionRecord>> {
        let mut matching: Vec<&ExecutionRecord> = self
            .snapshot
            .executions
            .iter()
            .filter(|r| r.parent_id.is_none())
            .filter(|r| &r.account_id == account_id)
            .filter(|r| matches_query(r, query))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    async fn list_by_ids(
        &self,
        account_id: &AccountId,
        ids: &[ExecutionId],
    ) -> anyhow::Result<Vec<ExecutionRecord>> {
        let wanted: HashSet<&ExecutionId> = ids.iter().collect();
        Ok(self
            .snapshot
            .executions
            .iter()
            .filter(|r| &r.account_id == account_id && wanted.contains(&r.id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LogStore for SnapshotSource {
    fn supports_in_query(&self) -> bool {
        !self.snapshot.single_key_logs
    }

    async fn query_by_activity_ids(&self, ids: &[ActivityId]) -> anyhow::Result<Vec<LogLine>> {
        if self.snapshot.single_key_logs {
            bail!("Multi-key log queries are not supported");
        }
        let wanted: HashSet<&ActivityId> = ids.iter().collect();
        Ok(self
            .snapshot
            .logs
            .iter()
            .filter(|l| wanted.contains(&l.activity_id))
            .cloned()
            .collect())
    }

    async fn query_by_activity_id(&self, id: &ActivityId) -> anyhow::Result<Vec<LogLine>> {
        Ok(self
            .snapshot
            .logs
            .iter()
            .filter(|l| &l.activity_id == id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl InterruptStore for SnapshotSource {
    async fn list_by_execution_ids(
        &self,
        ids: &[ExecutionId],
    ) -> anyhow::Result<Vec<InterruptRecord>> {
        Ok(self
            .snapshot
            .interrupts
            .iter()
            .filter(|i| ids.contains(&i.execution_id))
            .cloned()
            .collect())
    }

    async fn list_history_by_node_ids(
        &self,
        node_ids: &[String],
    ) -> anyhow::Result<Vec<InterruptRecord>> {
        Ok(self
            .snapshot
            .interrupt_history
            .iter()
            .filter(|i| i.node_id.as_ref().is_some_and(|n| node_ids.contains(n)))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl InspectionStore for SnapshotSource {
    async fn list_by_execution_ids(
        &self,
        ids: &[ExecutionId],
    ) -> anyhow::Result<Vec<InspectionRecord>> {
        Ok(self
            .snapshot
            .inspections
            .iter()
            .filter(|i| ids.contains(&i.execution_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ActivityStore for SnapshotSource {
    async fn list_by_ids(&self, ids: &[ActivityId]) -> anyhow::Result<Vec<Activity>> {
        Ok(self
            .snapshot
            .activities
            .iter()
            .filter(|a| ids.contains(&a.id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UserGroupStore for SnapshotSource {
    async fn resolve_names(&self, ids: &[UserGroupId]) -> anyhow::Result<Vec<UserGroupName>> {
        Ok(self
            .snapshot
            .user_groups
            .iter()
            .filter(|g| ids.contains(&g.id))
            .cloned()
            .collect())
    }
}

/// Issues snapshot-backed log clients that expire after `lifetime`.
pub struct SnapshotLogClients {
    source: Arc<SnapshotSource>,
    lifetime: chrono::Duration,
    issued: AtomicUsize,
}

impl SnapshotLogClients {
    pub fn new(source: Arc<SnapshotSource>, lifetime: chrono::Duration) -> Self {
        Self {
            source,
            lifetime,
            issued: AtomicUsize::new(0),
        }
    }

    /// Clients handed out so far.
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LogClientFactory for SnapshotLogClients {
    async fn create(&self) -> anyhow::Result<IssuedLogClient> {
        let n = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(issued = n, "Issuing snapshot log client");
        Ok(IssuedLogClient {
            client: self.source.clone(),
            expires_at: Utc::now() + self.lifetime,
        })
    }
}

/// Every account is active except the listed ones.
#[derive(Debug, Clone, Default)]
pub struct StaticAccountStatus {
    inactive: HashSet<AccountId>,
}

impl StaticAccountStatus {
    pub fn new(inactive: impl IntoIterator<Item = AccountId>) -> Self {
        Self {
            inactive: inactive.into_iter().collect(),
        }
    }
}

#[async_trait]
impl AccountStatus for StaticAccountStatus {
    async fn is_active(&self, account_id: &AccountId) -> anyhow::Result<bool> {
        Ok(!self.inactive.contains(account_id))
    }
}

/// Where a logged notification went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    User(UserId),
    Groups(Vec<UserGroupId>),
}

/// Writes notifications to the log and keeps them for inspection.
#[derive(Debug, Default)]
pub struct TracingNotificationDispatch {
    sent: Mutex<Vec<(Recipient, NotificationPayload)>>,
}

impl TracingNotificationDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Recipient, NotificationPayload)> {
        self.sent
            .lock()
            .map(|sent| sent.clone())
            .unwrap_or_default()
    }

    fn record(&self, recipient: Recipient, payload: &NotificationPayload) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((recipient, payload.clone()));
        }
    }
}

#[async_trait]
impl NotificationDispatch for TracingNotificationDispatch {
    async fn send_to_user(
        &self,
        payload: &NotificationPayload,
        user_id: &UserId,
    ) -> anyhow::Result<()> {
        info!(
            template = %payload.template_id,
            user_id = %user_id,
            placeholders = ?payload.placeholders,
            "Notify user"
        );
        self.record(Recipient::User(user_id.clone()), payload);
        Ok(())
    }

    async fn send_to_groups(
        &self,
        payload: &NotificationPayload,
        group_ids: &[UserGroupId],
    ) -> anyhow::Result<()> {
        info!(
            template = %payload.template_id,
            groups = ?group_ids,
            placeholders = ?payload.placeholders,
            "Notify user groups"
        );
        self.record(Recipient::Groups(group_ids.to_vec()), payload);
        Ok(())
    }
}

/// Wire a snapshot source and local storage into a full collaborator set.
pub fn local_collaborators(
    source: Arc<SnapshotSource>,
    blobs: Arc<dyn BlobStorage>,
    accounts: Arc<dyn AccountStatus>,
    notifications: Arc<dyn NotificationDispatch>,
) -> Collaborators {
    Collaborators {
        executions: source.clone(),
        logs: source.clone(),
        interrupts: source.clone(),
        inspections: source.clone(),
        activities: source.clone(),
        user_groups: source,
        blobs,
        accounts,
        notifications,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use execport_store::ExecutionKind;
    use tempfile::tempdir;

    fn record(id: &str, app: &str, created_at: i64) -> ExecutionRecord {
        ExecutionRecord {
            id: ExecutionId::from(id),
            account_id: AccountId::from("acct"),
            application_id: app.to_string(),
            application_name: None,
            entity_name: "deploy".to_string(),
            kind: ExecutionKind::Workflow,
            status: "SUCCESS".to_string(),
            triggered_by: Some("ada".to_string()),
            created_at,
            started_at: None,
            ended_at: None,
            parent_id: None,
            stages: Vec::new(),
            nodes: Vec::new(),
            interrupts: Vec::new(),
        }
    }

    #[test]
    fn test_matches_query_filters() {
        let r = record("e1", "app-1", 100);
        assert!(matches_query(&r, &ExecutionQuery::default()));

        let by_app = ExecutionQuery {
            application_ids: vec!["app-2".to_string()],
            ..Default::default()
        };
        assert!(!matches_query(&r, &by_app));

        let window = ExecutionQuery {
            created_after: Some(100),
            created_before: Some(101),
            ..Default::default()
        };
        assert!(matches_query(&r, &window));

        let upper_exclusive = ExecutionQuery {
            created_before: Some(100),
            ..Default::default()
        };
        assert!(!matches_query(&r, &upper_exclusive));

        let status = ExecutionQuery {
            statuses: vec!["success".to_string()],
            triggered_by: Some("ada".to_string()),
            ..Default::default()
        };
        assert!(matches_query(&r, &status));
    }

    #[tokio::test]
    async fn test_listing_skips_sub_executions_and_other_accounts() {
        let mut child = record("w1", "app-1", 300);
        child.parent_id = Some(ExecutionId::from("p1"));
        let mut foreign = record("x1", "app-1", 400);
        foreign.account_id = AccountId::from("other");

        let source = SnapshotSource::new(Snapshot {
            executions: vec![record("e1", "app-1", 100), record("e2", "app-1", 200), child, foreign],
            ..Default::default()
        });
        let page = source
            .list_executions(
                &AccountId::from("acct"),
                &ExecutionQuery::default(),
                PageRequest { offset: 0, limit: 10 },
            )
            .await
            .unwrap();
        let ids: Vec<_> = page.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["e2", "e1"]);

        let acct = AccountId::from("acct");
        let found = ExecutionStore::list_by_ids(&source, &acct, &[ExecutionId::from("w1")])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        let foreign = ExecutionStore::list_by_ids(&source, &acct, &[ExecutionId::from("x1")])
            .await
            .unwrap();
        assert!(foreign.is_empty());
    }

    #[tokio::test]
    async fn test_blob_upload_overwrites_and_delete_tolerates_absence() {
        let tmp = tempdir().unwrap();
        let staging = tmp.path().join("job-1.zip");
        let blobs = LocalBlobStorage::new(tmp.path().join("blobs"));
        let account = AccountId::from("acct");

        std::fs::write(&staging, b"first").unwrap();
        let first = blobs.upload(&account, &staging).await.unwrap();
        std::fs::write(&staging, b"second").unwrap();
        let second = blobs.upload(&account, &staging).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.as_str(), "acct/job-1.zip");
        let stored = blobs.path_of(&first).unwrap();
        assert_eq!(std::fs::read(&stored).unwrap(), b"second");

        assert!(blobs.delete(&first).await.unwrap());
        assert!(!blobs.delete(&first).await.unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_log_clients_serve_snapshot_logs() {
        let source = Arc::new(SnapshotSource::new(Snapshot {
            logs: vec![LogLine {
                activity_id: ActivityId::from("a1"),
                command_unit: "Execute".to_string(),
                timestamp: 1,
                level: "INFO".to_string(),
                message: "hello".to_string(),
            }],
            ..Default::default()
        }));
        let clients = SnapshotLogClients::new(source, chrono::Duration::minutes(10));

        let issued = clients.create().await.unwrap();
        assert!(issued.expires_at > Utc::now());
        let lines = issued
            .client
            .query_by_activity_id(&ActivityId::from("a1"))
            .await
            .unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(clients.issued(), 1);
    }

    #[test]
    fn test_blob_path_rejects_traversal() {
        let blobs = LocalBlobStorage::new("/tmp/blobs");
        assert!(blobs.path_of(&FileId::from("../etc/passwd")).is_err());
        assert!(blobs.path_of(&FileId::from("/etc/passwd")).is_err());
        assert!(blobs.path_of(&FileId::from("acct/file.zip")).is_ok());
    }
}
