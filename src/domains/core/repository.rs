use async_trait::async_trait;
use sqlx::{Sqlite, Transaction};
use uuid::Uuid;

use crate::errors::DomainResult;

/// Identity and version of a synced record
pub trait Versioned {
    fn record_id(&self) -> Uuid;
    fn version(&self) -> i64;
}

/// Trait for finding live (not soft-deleted) entities by ID
#[async_trait]
pub trait FindById<T> {
    async fn find_by_id(&self, id: Uuid) -> DomainResult<T>;
}

/// Row-level access the pull path needs to apply remote state.
///
/// Both methods see soft-deleted rows: a tombstoned record still carries the
/// version that gates later remote writes.
#[async_trait]
pub trait MergeableEntityRepository<T>: Send + Sync {
    /// The table this repository owns
    fn entity_name(&self) -> &'static str;

    /// Current local version, or `None` if the id was never stored
    async fn find_version_with_tx<'t>(
        &self,
        id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<i64>>;

    /// Write the remote record verbatim (version and timestamps included).
    /// Never appends to the outbox.
    async fn upsert_remote_with_tx<'t>(
        &self,
        entity: &T,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;
}
