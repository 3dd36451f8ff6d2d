// sync/entity_merger/mod.rs

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sqlx::{Sqlite, Transaction};

use crate::domains::core::repository::{MergeableEntityRepository, Versioned};
use crate::domains::outbox::repository::OutboxRepository;
use crate::domains::sync::types::{MergeOutcome, MergeSummary};
use crate::errors::{DomainError, DomainResult, ValidationError};

/// Applies remote records of one table
#[async_trait]
pub trait DomainEntityMerger: Send + Sync {
    /// Get the entity table name this merger handles
    fn entity_table(&self) -> &'static str;

    /// Apply one remote record under version-gated last-writer-wins.
    /// A malformed record is an error.
    async fn merge_with_tx<'t>(
        &self,
        value: &serde_json::Value,
        protect_pending_local_edits: bool,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<MergeOutcome>;
}

/// Generic merger over any repository that can expose versions and write
/// remote state verbatim
pub struct VersionedEntityMerger<T> {
    repo: Arc<dyn MergeableEntityRepository<T>>,
    outbox_repo: Arc<dyn OutboxRepository>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> VersionedEntityMerger<T> {
    pub fn new(repo: Arc<dyn MergeableEntityRepository<T>>, outbox_repo: Arc<dyn OutboxRepository>) -> Self {
        Self {
            repo,
            outbox_repo,
            _entity: PhantomData,
        }
    }
}

#[async_trait]
impl<T> DomainEntityMerger for VersionedEntityMerger<T>
where
    T: DeserializeOwned + Versioned + Send + Sync + 'static,
{
    fn entity_table(&self) -> &'static str {
        self.repo.entity_name()
    }

    async fn merge_with_tx<'t>(
        &self,
        value: &serde_json::Value,
        protect_pending_local_edits: bool,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<MergeOutcome> {
        let table = self.entity_table();
        let record: T = serde_json::from_value(value.clone()).map_err(|e| {
            DomainError::Validation(ValidationError::entity(&format!("Malformed {} record: {}", table, e)))
        })?;
        let id = record.record_id();
        let remote_version = record.version();

        let outcome = match self.repo.find_version_with_tx(id, tx).await? {
            None => {
                self.repo.upsert_remote_with_tx(&record, tx).await?;
                MergeOutcome::Inserted
            }
            Some(local_version) if remote_version > local_version => {
                if protect_pending_local_edits
                    && self.outbox_repo.has_unsynced_for_with_tx(table, id, tx).await?
                {
                    MergeOutcome::SkippedPendingLocal
                } else {
                    self.repo.upsert_remote_with_tx(&record, tx).await?;
                    MergeOutcome::Overwritten
                }
            }
            Some(_) => MergeOutcome::SkippedStale,
        };

        log::debug!("Merge {} {} v{}: {:?}", table, id, remote_version, outcome);
        Ok(outcome)
    }
}

/// Central entity merger that dispatches remote records by table
pub struct EntityMerger {
    mergers: HashMap<String, Arc<dyn DomainEntityMerger>>,
    /// Registration order, used as apply order within a page
    order: Vec<String>,
}

impl EntityMerger {
    pub fn new() -> Self {
        Self {
            mergers: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register a domain-specific merger
    pub fn register_merger(&mut self, merger: Arc<dyn DomainEntityMerger>) {
        let table = merger.entity_table().to_string();
        if self.mergers.insert(table.clone(), merger).is_none() {
            self.order.push(table);
        }
    }

    pub fn handles(&self, table: &str) -> bool {
        self.mergers.contains_key(table)
    }

    /// Apply one pull page. Unknown tables are skipped with a warning; any
    /// other failure aborts the page.
    pub async fn apply_page_with_tx<'t>(
        &self,
        entities_by_table: &HashMap<String, Vec<serde_json::Value>>,
        protect_pending_local_edits: bool,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<MergeSummary> {
        let mut summary = MergeSummary::default();

        for (table, records) in entities_by_table {
            if !self.handles(table) {
                log::warn!("Skipping {} records for unknown table '{}'", records.len(), table);
                summary.skipped_unknown_table += records.len();
            }
        }

        for table in &self.order {
            let (Some(records), Some(merger)) = (entities_by_table.get(table), self.mergers.get(table)) else {
                continue;
            };
            for value in records {
                let outcome = merger.merge_with_tx(value, protect_pending_local_edits, tx).await?;
                summary.record(outcome);
            }
        }

        Ok(summary)
    }
}

impl Default for EntityMerger {
    fn default() -> Self {
        Self::new()
    }
}
