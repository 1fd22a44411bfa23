//! Export job data model.

use execport_ids::{AccountId, ExecutionId, ExportJobId, FileId, UserGroupId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current time as milliseconds since Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Convert milliseconds since epoch to a UTC datetime.
pub fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Timestamp layout shown to people (READMEs, notifications).
pub const DISPLAY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Milliseconds since epoch rendered with [`DISPLAY_TIMESTAMP_FORMAT`].
pub fn format_millis(millis: i64) -> String {
    millis_to_datetime(millis)
        .format(DISPLAY_TIMESTAMP_FORMAT)
        .to_string()
}

/// Lifecycle status of an export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportStatus {
    Queued,
    Ready,
    Failed,
    Expired,
}

impl ExportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Ready => "READY",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "READY" => Some(Self::Ready),
            "FAILED" => Some(Self::Failed),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` respects QUEUED -> READY|FAILED -> EXPIRED.
    pub fn can_transition_to(&self, next: ExportStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Ready)
                | (Self::Queued, Self::Failed)
                | (Self::Ready, Self::Expired)
                | (Self::Failed, Self::Expired)
        )
    }
}

impl fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serialization format of the per-execution summary file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputFormat {
    #[default]
    Json,
    Yaml,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "JSON",
            Self::Yaml => "YAML",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "JSON" => Some(Self::Json),
            "YAML" | "YML" => Some(Self::Yaml),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Yaml => "yaml",
        }
    }
}

/// Workflow executions run a single graph; pipeline executions run stages
/// that may each point at a workflow sub-execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionKind {
    Workflow,
    Pipeline,
}

/// Filter criteria selecting the executions an export covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionQuery {
    pub application_ids: Vec<String>,
    pub kinds: Vec<ExecutionKind>,
    pub statuses: Vec<String>,
    /// Inclusive lower bound on creation time (ms).
    pub created_after: Option<i64>,
    /// Exclusive upper bound on creation time (ms).
    pub created_before: Option<i64>,
    pub triggered_by: Option<String>,
    /// Explicit execution ids; empty means "any".
    pub execution_ids: Vec<ExecutionId>,
}

/// Who gets told when the export finishes. Never both.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyTarget {
    #[default]
    None,
    TriggeringUser {
        user_id: UserId,
    },
    UserGroups {
        group_ids: Vec<UserGroupId>,
    },
}

/// The user who submitted the export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Time-bounded exclusive claim on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: i64,
}

/// A persisted export request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: ExportJobId,
    pub account_id: AccountId,
    pub status: ExportStatus,
    pub query: ExecutionQuery,
    pub output_format: OutputFormat,
    pub notify_target: NotifyTarget,
    pub requested_by: Requester,
    pub created_at: i64,
    pub updated_at: i64,
    /// READY jobs: when the archive is purged.
    pub expires_at: Option<i64>,
    pub file_id: Option<FileId>,
    pub total_executions: Option<i64>,
    pub error_message: Option<String>,
    /// Earliest time the export iterator may claim this job again.
    pub next_iteration: i64,
    pub lease: Option<Lease>,
    /// Number of times the export iterator has claimed this job.
    pub attempts: i32,
}

impl ExportJob {
    pub fn is_leased_by(&self, owner: &str) -> bool {
        self.lease.as_ref().is_some_and(|l| l.owner == owner)
    }
}

/// Submission payload; everything else is filled in by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExportJob {
    pub account_id: AccountId,
    #[serde(default)]
    pub query: ExecutionQuery,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub notify_target: NotifyTarget,
    pub requested_by: Requester,
}

/// Which iterator is claiming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    /// QUEUED jobs whose `next_iteration` has arrived.
    Export,
    /// READY jobs whose `expires_at` has passed.
    Cleanup,
}

impl ClaimKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Export => "export",
            Self::Cleanup => "cleanup",
        }
    }
}

/// Fields written when an export completes.
#[derive(Debug, Clone)]
pub struct ReadyUpdate {
    pub file_id: FileId,
    pub total_executions: i64,
    pub expires_at: i64,
}

/// Count of jobs per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: u64,
    pub ready: u64,
    pub failed: u64,
    pub expired: u64,
    pub leased: u64,
}
