//! Paged reads from the execution store.

use execport_ids::{AccountId, ExecutionId};
use execport_store::ExecutionQuery;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::collaborators::{ExecutionStore, PageRequest};
use crate::error::{ExportError, Result};
use crate::model::Batch;

// Bounds the resolution loop when sub-executions are themselves pipelines.
const MAX_RESOLUTION_DEPTH: usize = 8;

pub struct BatchFetcher {
    executions: Arc<dyn ExecutionStore>,
    page_size: usize,
}

impl BatchFetcher {
    pub fn new(executions: Arc<dyn ExecutionStore>, page_size: usize) -> Self {
        Self {
            executions,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Fetch page `page_offset` and resolve every sub-execution it references.
    ///
    /// An empty batch means the listing is exhausted. Sub-executions are
    /// bulk-loaded with one `list_by_ids` call per nesting level; references
    /// the store cannot resolve are cleared.
    pub async fn fetch_batch(
        &self,
        account_id: &AccountId,
        query: &ExecutionQuery,
        page_offset: u32,
    ) -> Result<Batch> {
        let page = PageRequest {
            offset: page_offset as usize * self.page_size,
            limit: self.page_size,
        };
        let mut records = self
            .executions
            .list_executions(account_id, query, page)
            .await
            .map_err(ExportError::Fetch)?;

        // Stable, so equal timestamps keep the store's order.
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut batch = Batch::new(page_offset, records);
        if batch.is_empty() {
            return Ok(batch);
        }

        self.resolve_sub_executions(account_id, &mut batch).await?;
        debug!(
            page = page_offset,
            records = batch.top_level_len(),
            sub_executions = batch.records().len() - batch.top_level_len(),
            "Fetched execution page"
        );
        Ok(batch)
    }

    async fn resolve_sub_executions(&self, account_id: &AccountId, batch: &mut Batch) -> Result<()> {
        let mut scanned = 0;
        let mut requested: HashSet<ExecutionId> = HashSet::new();

        for _ in 0..MAX_RESOLUTION_DEPTH {
            let end = batch.records().len();
            let missing: Vec<ExecutionId> = batch.records()[scanned..end]
                .iter()
                .flat_map(|r| r.stages.iter())
                .filter_map(|s| s.sub_execution_id.clone())
                .filter(|id| batch.index_of(id).is_none() && !requested.contains(id))
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            scanned = end;

            if missing.is_empty() {
                break;
            }

            let fetched = self
                .executions
                .list_by_ids(account_id, &missing)
                .await
                .map_err(ExportError::Fetch)?;
            requested.extend(missing);
            for record in fetched {
                if &record.account_id != account_id {
                    warn!(
                        execution_id = %record.id,
                        account_id = %record.account_id,
                        "Sub-execution belongs to another account; skipping"
                    );
                    continue;
                }
                batch.insert_sub_execution(record);
            }
        }

        let mut cleared = Vec::new();
        let lookup: Vec<Vec<Option<usize>>> = batch
            .records()
            .iter()
            .map(|r| {
                r.stages
                    .iter()
                    .map(|s| s.sub_execution_id.as_ref().and_then(|id| batch.index_of(id)))
                    .collect()
            })
            .collect();

        for (record, slots) in batch.records_mut().iter_mut().zip(lookup) {
            for (stage, slot) in record.stages.iter_mut().zip(slots) {
                stage.resolved = slot;
                if slot.is_none() {
                    if let Some(id) = stage.sub_execution_id.take() {
                        cleared.push((record.id.clone(), id));
                    }
                }
            }
        }

        for (parent, child) in cleared {
            warn!(
                execution_id = %parent,
                sub_execution_id = %child,
                "Sub-execution not found; dropping stage reference"
            );
        }
        Ok(())
    }
}
