//! Log store access through short-lived credentials.
//!
//! Log backends typically hand out clients bound to a token with an expiry.
//! [`RefreshingLogStore`] keeps the current client and replaces it through
//! the factory once it is within `refresh_margin` of expiring.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use execport_ids::ActivityId;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::collaborators::LogStore;
use crate::model::LogLine;

/// A client together with the instant its credentials stop working.
#[derive(Clone)]
pub struct IssuedLogClient {
    pub client: Arc<dyn LogStore>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait LogClientFactory: Send + Sync {
    async fn create(&self) -> anyhow::Result<IssuedLogClient>;
}

pub struct RefreshingLogStore {
    factory: Arc<dyn LogClientFactory>,
    refresh_margin: Duration,
    supports_in_query: bool,
    current: Mutex<Option<IssuedLogClient>>,
}

impl RefreshingLogStore {
    pub fn new(
        factory: Arc<dyn LogClientFactory>,
        refresh_margin: Duration,
        supports_in_query: bool,
    ) -> Self {
        Self {
            factory,
            refresh_margin,
            supports_in_query,
            current: Mutex::new(None),
        }
    }

    /// The live client, recreated when missing or about to expire.
    async fn client(&self) -> anyhow::Result<Arc<dyn LogStore>> {
        let mut current = self.current.lock().await;
        let fresh_until = Utc::now() + self.refresh_margin;
        if let Some(issued) = current.as_ref() {
            if issued.expires_at > fresh_until {
                return Ok(issued.client.clone());
            }
        }

        let issued = self.factory.create().await?;
        info!(expires_at = %issued.expires_at, "Log client credentials refreshed");
        let client = issued.client.clone();
        *current = Some(issued);
        Ok(client)
    }
}

#[async_trait]
impl LogStore for RefreshingLogStore {
    fn supports_in_query(&self) -> bool {
        self.supports_in_query
    }

    async fn query_by_activity_ids(&self, ids: &[ActivityId]) -> anyhow::Result<Vec<LogLine>> {
        self.client().await?.query_by_activity_ids(ids).await
    }

    async fn query_by_activity_id(&self, id: &ActivityId) -> anyhow::Result<Vec<LogLine>> {
        self.client().await?.query_by_activity_id(id).await
    }
}
