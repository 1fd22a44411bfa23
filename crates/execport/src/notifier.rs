//! Completion and failure notifications.

use execport_ids::{AccountId, ExportJobId};
use execport_store::{format_millis, ExportJob, ExportStatus, NotifyTarget};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::collaborators::{NotificationDispatch, NotificationPayload};
use crate::metrics::METRICS;

pub const READY_TEMPLATE: &str = "export_executions_ready";
pub const FAILED_TEMPLATE: &str = "export_executions_failed";

/// `{base}/{job_id}?accountId={account_id}`
pub fn download_link(base_url: &str, job_id: &ExportJobId, account_id: &AccountId) -> String {
    format!(
        "{}/{}?accountId={}",
        base_url.trim_end_matches('/'),
        job_id,
        account_id
    )
}

pub struct Notifier {
    dispatch: Arc<dyn NotificationDispatch>,
    download_base_url: String,
}

impl Notifier {
    pub fn new(dispatch: Arc<dyn NotificationDispatch>, download_base_url: impl Into<String>) -> Self {
        Self {
            dispatch,
            download_base_url: download_base_url.into(),
        }
    }

    /// Template and placeholders for a finished job; `None` for QUEUED/EXPIRED.
    pub fn build_payload(&self, job: &ExportJob) -> Option<NotificationPayload> {
        let template_id = match job.status {
            ExportStatus::Ready => READY_TEMPLATE,
            ExportStatus::Failed => FAILED_TEMPLATE,
            ExportStatus::Queued | ExportStatus::Expired => return None,
        };

        let mut placeholders = BTreeMap::new();
        placeholders.insert("request_id".to_string(), job.id.to_string());
        placeholders.insert("requester".to_string(), job.requested_by.name.clone());
        placeholders.insert("created_at".to_string(), format_millis(job.created_at));
        placeholders.insert(
            "total_executions".to_string(),
            job.total_executions.unwrap_or(0).to_string(),
        );

        match job.status {
            ExportStatus::Ready => {
                placeholders.insert(
                    "download_link".to_string(),
                    download_link(&self.download_base_url, &job.id, &job.account_id),
                );
                if let Some(expires_at) = job.expires_at {
                    placeholders.insert("expires_at".to_string(), format_millis(expires_at));
                }
            }
            _ => {
                placeholders.insert(
                    "error_message".to_string(),
                    job.error_message
                        .clone()
                        .unwrap_or_else(|| "Unknown error".to_string()),
                );
            }
        }

        Some(NotificationPayload {
            template_id: template_id.to_string(),
            placeholders,
        })
    }

    /// Notify the job's target. Returns whether anything was sent.
    ///
    /// Never fails: dispatch errors are logged and counted only.
    pub async fn dispatch(&self, job: &ExportJob) -> bool {
        let Some(payload) = self.build_payload(job) else {
            return false;
        };

        let sent = match &job.notify_target {
            NotifyTarget::None => {
                debug!(job_id = %job.id, "No notification target");
                return false;
            }
            NotifyTarget::UserGroups { group_ids } if group_ids.is_empty() => {
                debug!(job_id = %job.id, "Notification group list is empty");
                return false;
            }
            NotifyTarget::TriggeringUser { user_id } => {
                self.dispatch.send_to_user(&payload, user_id).await
            }
            NotifyTarget::UserGroups { group_ids } => {
                self.dispatch.send_to_groups(&payload, group_ids).await
            }
        };

        match sent {
            Ok(()) => {
                METRICS.inc_notifications_sent();
                info!(job_id = %job.id, template = %payload.template_id, "Notification sent");
                true
            }
            Err(e) => {
                METRICS.inc_notifications_failed();
                warn!(job_id = %job.id, "Failed to send export notification: {:#}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use execport_ids::{UserGroupId, UserId};
    use execport_store::{ExecutionQuery, OutputFormat, Requester};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        users: Mutex<Vec<(String, UserId)>>,
        groups: Mutex<Vec<(String, Vec<UserGroupId>)>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationDispatch for Recorder {
        async fn send_to_user(
            &self,
            payload: &NotificationPayload,
            user_id: &UserId,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("smtp down");
            }
            self.users
                .lock()
                .unwrap()
                .push((payload.template_id.clone(), user_id.clone()));
            Ok(())
        }

        async fn send_to_groups(
            &self,
            payload: &NotificationPayload,
            group_ids: &[UserGroupId],
        ) -> anyhow::Result<()> {
            self.groups
                .lock()
                .unwrap()
                .push((payload.template_id.clone(), group_ids.to_vec()));
            Ok(())
        }
    }

    fn job(status: ExportStatus, target: NotifyTarget) -> ExportJob {
        ExportJob {
            id: ExportJobId::new(),
            account_id: AccountId::from("acct-1"),
            status,
            query: ExecutionQuery::default(),
            output_format: OutputFormat::Json,
            notify_target: target,
            requested_by: Requester {
                id: UserId::from("u1"),
                name: "Ada".to_string(),
                email: None,
            },
            created_at: 0,
            updated_at: 0,
            expires_at: Some(86_400_000),
            file_id: None,
            total_executions: Some(25),
            error_message: Some("boom".to_string()),
            next_iteration: 0,
            lease: None,
            attempts: 1,
        }
    }

    #[test]
    fn test_ready_payload_placeholders() {
        let notifier = Notifier::new(Arc::new(Recorder::default()), "https://x/dl/");
        let job = job(ExportStatus::Ready, NotifyTarget::None);
        let payload = notifier.build_payload(&job).unwrap();

        assert_eq!(payload.template_id, READY_TEMPLATE);
        assert_eq!(payload.placeholders["created_at"], "1970-01-01 00:00:00 UTC");
        assert_eq!(payload.placeholders["expires_at"], "1970-01-02 00:00:00 UTC");
        assert_eq!(payload.placeholders["total_executions"], "25");
        assert_eq!(
            payload.placeholders["download_link"],
            format!("https://x/dl/{}?accountId=acct-1", job.id)
        );
        assert!(!payload.placeholders.contains_key("error_message"));
    }

    #[test]
    fn test_no_payload_for_non_terminal_status() {
        let notifier = Notifier::new(Arc::new(Recorder::default()), "https://x");
        assert!(notifier
            .build_payload(&job(ExportStatus::Queued, NotifyTarget::None))
            .is_none());
        assert!(notifier
            .build_payload(&job(ExportStatus::Expired, NotifyTarget::None))
            .is_none());
    }

    #[tokio::test]
    async fn test_routes_to_user_or_groups_never_both() {
        let recorder = Arc::new(Recorder::default());
        let notifier = Notifier::new(recorder.clone(), "https://x");

        let user = NotifyTarget::TriggeringUser {
            user_id: UserId::from("u9"),
        };
        assert!(notifier.dispatch(&job(ExportStatus::Failed, user)).await);

        let groups = NotifyTarget::UserGroups {
            group_ids: vec![UserGroupId::from("g1")],
        };
        assert!(notifier.dispatch(&job(ExportStatus::Ready, groups)).await);

        let empty = NotifyTarget::UserGroups { group_ids: vec![] };
        assert!(!notifier.dispatch(&job(ExportStatus::Ready, empty)).await);
        assert!(!notifier
            .dispatch(&job(ExportStatus::Ready, NotifyTarget::None))
            .await);

        let users = recorder.users.lock().unwrap();
        let groups = recorder.groups.lock().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].0, FAILED_TEMPLATE);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0, READY_TEMPLATE);
    }

    #[tokio::test]
    async fn test_dispatch_failure_is_swallowed() {
        let notifier = Notifier::new(
            Arc::new(Recorder {
                fail: true,
                ..Recorder::default()
            }),
            "https://x",
        );
        let target = NotifyTarget::TriggeringUser {
            user_id: UserId::from("u1"),
        };
        assert!(!notifier.dispatch(&job(ExportStatus::Ready, target)).await);
    }
}
