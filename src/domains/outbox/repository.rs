use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, query_scalar, QueryBuilder, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::domains::outbox::types::{Change, FailureOutcome, OutboxEntry, OutboxEntryRow, OutboxOperation};
use crate::errors::{DbError, DomainError, DomainResult};
use crate::types::to_db_timestamp;

const ENTRY_COLUMNS: &str = "sequence_id, table_name, operation, record_id, payload, idempotency_key, \
    created_at, synced, synced_at, attempts, last_error, dead_lettered";

/// Repository for the change-capture outbox
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Append an entry for a mutation inside the mutation's own transaction
    async fn append_with_tx<'t>(
        &self,
        change: &Change,
        operation: OutboxOperation,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<OutboxEntry>;

    /// Pending entries (not synced, not dead-lettered), oldest first
    async fn list_unsynced(&self, limit: u32) -> DomainResult<Vec<OutboxEntry>>;

    async fn find_by_sequence_id(&self, sequence_id: i64) -> DomainResult<OutboxEntry>;

    /// All entries for one record, oldest first
    async fn find_for_record(&self, table: &str, record_id: Uuid) -> DomainResult<Vec<OutboxEntry>>;

    /// Mark one entry synced. Returns false if it already was.
    async fn mark_synced(&self, sequence_id: i64) -> DomainResult<bool>;

    /// Mark many entries synced in one transaction. Returns the number that transitioned.
    async fn mark_synced_batch(&self, sequence_ids: &[i64]) -> DomainResult<u64>;

    /// Count a remote rejection and dead-letter the entry once `max_attempts` is reached
    async fn record_failure(
        &self,
        sequence_id: i64,
        error: &str,
        max_attempts: Option<u32>,
    ) -> DomainResult<FailureOutcome>;

    /// Entries waiting for delivery (excludes dead-lettered)
    async fn count_unsynced(&self) -> DomainResult<i64>;

    async fn count_dead_lettered(&self) -> DomainResult<i64>;

    async fn list_dead_lettered(&self) -> DomainResult<Vec<OutboxEntry>>;

    /// Put a dead-lettered entry back in the queue with a fresh attempt count
    async fn requeue_dead_lettered(&self, sequence_id: i64) -> DomainResult<bool>;

    /// Whether any unsynced entry (dead-lettered included) references the record
    async fn has_unsynced_for_with_tx<'t>(
        &self,
        table: &str,
        record_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<bool>;

    /// Delete synced entries created before `older_than`, keeping any whose
    /// record still has unsynced entries
    async fn cleanup_synced(&self, older_than: DateTime<Utc>) -> DomainResult<u64>;
}

/// SQLite implementation of the OutboxRepository
pub struct SqliteOutboxRepository {
    pool: SqlitePool,
}

impl SqliteOutboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxRepository for SqliteOutboxRepository {
    async fn append_with_tx<'t>(
        &self,
        change: &Change,
        operation: OutboxOperation,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<OutboxEntry> {
        let payload = change.to_payload()?;
        let idempotency_key = Uuid::new_v4();
        let created_at = Utc::now();
        let record_id = change.record_id();

        let result = query(
            "INSERT INTO sync_outbox (table_name, operation, record_id, payload, idempotency_key, created_at, synced, attempts, dead_lettered)
             VALUES (?, ?, ?, ?, ?, ?, 0, 0, 0)",
        )
        .bind(change.table_name())
        .bind(operation.as_str())
        .bind(record_id.to_string())
        .bind(&payload)
        .bind(idempotency_key.to_string())
        .bind(to_db_timestamp(&created_at))
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        log::debug!(
            "Outbox append: {} {} {} (key {})",
            operation, change.table_name(), record_id, idempotency_key
        );

        Ok(OutboxEntry {
            sequence_id: result.last_insert_rowid(),
            table_name: change.table_name().to_string(),
            operation,
            record_id,
            payload,
            idempotency_key,
            created_at,
            synced: false,
            synced_at: None,
            attempts: 0,
            last_error: None,
            dead_lettered: false,
        })
    }

    async fn list_unsynced(&self, limit: u32) -> DomainResult<Vec<OutboxEntry>> {
        let sql = format!(
            "SELECT {} FROM sync_outbox
             WHERE synced = 0 AND dead_lettered = 0
             ORDER BY created_at ASC, sequence_id ASC
             LIMIT ?",
            ENTRY_COLUMNS
        );
        let rows = query_as::<_, OutboxEntryRow>(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        rows.into_iter().map(OutboxEntryRow::into_entity).collect()
    }

    async fn find_by_sequence_id(&self, sequence_id: i64) -> DomainResult<OutboxEntry> {
        let sql = format!("SELECT {} FROM sync_outbox WHERE sequence_id = ?", ENTRY_COLUMNS);
        let row = query_as::<_, OutboxEntryRow>(&sql)
            .bind(sequence_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::Database(DbError::NotFound("sync_outbox".to_string(), sequence_id.to_string())))?;

        row.into_entity()
    }

    async fn find_for_record(&self, table: &str, record_id: Uuid) -> DomainResult<Vec<OutboxEntry>> {
        let sql = format!(
            "SELECT {} FROM sync_outbox WHERE table_name = ? AND record_id = ? ORDER BY sequence_id ASC",
            ENTRY_COLUMNS
        );
        let rows = query_as::<_, OutboxEntryRow>(&sql)
            .bind(table)
            .bind(record_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        rows.into_iter().map(OutboxEntryRow::into_entity).collect()
    }

    async fn mark_synced(&self, sequence_id: i64) -> DomainResult<bool> {
        let result = query("UPDATE sync_outbox SET synced = 1, synced_at = ? WHERE sequence_id = ? AND synced = 0")
            .bind(to_db_timestamp(&Utc::now()))
            .bind(sequence_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_synced_batch(&self, sequence_ids: &[i64]) -> DomainResult<u64> {
        if sequence_ids.is_empty() {
            return Ok(0);
        }

        let now = to_db_timestamp(&Utc::now());
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let mut updated = 0u64;

        for chunk in sequence_ids.chunks(500) {
            let mut builder = QueryBuilder::<Sqlite>::new("UPDATE sync_outbox SET synced = 1, synced_at = ");
            builder.push_bind(now.clone());
            builder.push(" WHERE synced = 0 AND sequence_id IN (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            let result = builder.build().execute(&mut *tx).await.map_err(DbError::from)?;
            updated += result.rows_affected();
        }

        tx.commit().await.map_err(DbError::from)?;
        Ok(updated)
    }

    async fn record_failure(
        &self,
        sequence_id: i64,
        error: &str,
        max_attempts: Option<u32>,
    ) -> DomainResult<FailureOutcome> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;

        let attempts: Option<i64> = query_scalar(
            "UPDATE sync_outbox SET attempts = attempts + 1, last_error = ?
             WHERE sequence_id = ? AND synced = 0
             RETURNING attempts",
        )
        .bind(error)
        .bind(sequence_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::from)?;

        let outcome = match (attempts, max_attempts) {
            (None, _) => FailureOutcome::NotPending,
            (Some(attempts), Some(max)) if attempts >= max as i64 => {
                query("UPDATE sync_outbox SET dead_lettered = 1 WHERE sequence_id = ?")
                    .bind(sequence_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(DbError::from)?;
                log::warn!(
                    "Outbox entry {} dead-lettered after {} rejected attempts: {}",
                    sequence_id, attempts, error
                );
                FailureOutcome::DeadLettered { attempts }
            }
            (Some(attempts), _) => FailureOutcome::WillRetry { attempts },
        };

        tx.commit().await.map_err(DbError::from)?;
        Ok(outcome)
    }

    async fn count_unsynced(&self) -> DomainResult<i64> {
        let count = query_scalar("SELECT COUNT(*) FROM sync_outbox WHERE synced = 0 AND dead_lettered = 0")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(count)
    }

    async fn count_dead_lettered(&self) -> DomainResult<i64> {
        let count = query_scalar("SELECT COUNT(*) FROM sync_outbox WHERE synced = 0 AND dead_lettered = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(count)
    }

    async fn list_dead_lettered(&self) -> DomainResult<Vec<OutboxEntry>> {
        let sql = format!(
            "SELECT {} FROM sync_outbox WHERE synced = 0 AND dead_lettered = 1 ORDER BY created_at ASC, sequence_id ASC",
            ENTRY_COLUMNS
        );
        let rows = query_as::<_, OutboxEntryRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        rows.into_iter().map(OutboxEntryRow::into_entity).collect()
    }

    async fn requeue_dead_lettered(&self, sequence_id: i64) -> DomainResult<bool> {
        let result = query(
            "UPDATE sync_outbox SET dead_lettered = 0, attempts = 0
             WHERE sequence_id = ? AND synced = 0 AND dead_lettered = 1",
        )
        .bind(sequence_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(result.rows_affected() > 0)
    }

    async fn has_unsynced_for_with_tx<'t>(
        &self,
        table: &str,
        record_id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<bool> {
        let count: i64 = query_scalar(
            "SELECT COUNT(*) FROM sync_outbox WHERE table_name = ? AND record_id = ? AND synced = 0",
        )
        .bind(table)
        .bind(record_id.to_string())
        .fetch_one(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(count > 0)
    }

    async fn cleanup_synced(&self, older_than: DateTime<Utc>) -> DomainResult<u64> {
        let result = query(
            "DELETE FROM sync_outbox
             WHERE synced = 1
               AND created_at < ?
               AND NOT EXISTS (
                   SELECT 1 FROM sync_outbox pending
                   WHERE pending.synced = 0
                     AND pending.table_name = sync_outbox.table_name
                     AND pending.record_id = sync_outbox.record_id
               )",
        )
        .bind(to_db_timestamp(&older_than))
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        if result.rows_affected() > 0 {
            log::info!("Outbox cleanup removed {} synced entries", result.rows_affected());
        }
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::product::types::Product;
    use crate::test_support::migrated_pool;
    use rust_decimal_macros::dec;

    fn product(version: i64) -> Product {
        let now = Utc::now();
        Product {
            id: Uuid::new_v4(),
            sku: format!("SKU-{}", version),
            name: "Widget".into(),
            price: dec!(1.00),
            stock_quantity: 1,
            category: None,
            barcode: None,
            active: true,
            version,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    async fn append(repo: &SqliteOutboxRepository, pool: &SqlitePool, change: Change) -> OutboxEntry {
        let mut tx = pool.begin().await.unwrap();
        let entry = repo.append_with_tx(&change, OutboxOperation::Insert, &mut tx).await.unwrap();
        tx.commit().await.unwrap();
        entry
    }

    #[tokio::test]
    async fn pending_entries_come_back_in_fifo_order() {
        let pool = migrated_pool().await;
        let repo = SqliteOutboxRepository::new(pool.clone());

        let mut appended = Vec::new();
        for v in 1..=4 {
            appended.push(append(&repo, &pool, Change::Product(product(v))).await.sequence_id);
        }

        let pending: Vec<_> = repo.list_unsynced(10).await.unwrap().iter().map(|e| e.sequence_id).collect();
        assert_eq!(pending, appended);
        assert_eq!(repo.list_unsynced(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn marking_synced_is_idempotent() {
        let pool = migrated_pool().await;
        let repo = SqliteOutboxRepository::new(pool.clone());
        let a = append(&repo, &pool, Change::Product(product(1))).await;
        let b = append(&repo, &pool, Change::Product(product(1))).await;

        assert!(repo.mark_synced(a.sequence_id).await.unwrap());
        assert!(!repo.mark_synced(a.sequence_id).await.unwrap());
        assert_eq!(repo.mark_synced_batch(&[a.sequence_id, b.sequence_id]).await.unwrap(), 1);
        assert_eq!(repo.count_unsynced().await.unwrap(), 0);

        let stored = repo.find_by_sequence_id(a.sequence_id).await.unwrap();
        assert!(stored.synced);
        assert!(stored.synced_at.is_some());
        assert_eq!(stored.idempotency_key, a.idempotency_key);
    }

    #[tokio::test]
    async fn repeated_rejections_dead_letter_the_entry() {
        let pool = migrated_pool().await;
        let repo = SqliteOutboxRepository::new(pool.clone());
        let entry = append(&repo, &pool, Change::Product(product(1))).await;

        assert_eq!(
            repo.record_failure(entry.sequence_id, "bad sku", Some(2)).await.unwrap(),
            FailureOutcome::WillRetry { attempts: 1 }
        );
        assert_eq!(
            repo.record_failure(entry.sequence_id, "bad sku", Some(2)).await.unwrap(),
            FailureOutcome::DeadLettered { attempts: 2 }
        );
        assert_eq!(repo.count_unsynced().await.unwrap(), 0);
        assert_eq!(repo.count_dead_lettered().await.unwrap(), 1);
        assert!(repo.list_unsynced(10).await.unwrap().is_empty());

        let parked = repo.list_dead_lettered().await.unwrap();
        assert_eq!(parked[0].last_error.as_deref(), Some("bad sku"));

        assert!(repo.requeue_dead_lettered(entry.sequence_id).await.unwrap());
        assert_eq!(repo.list_unsynced(10).await.unwrap()[0].attempts, 0);

        repo.mark_synced(entry.sequence_id).await.unwrap();
        assert_eq!(
            repo.record_failure(entry.sequence_id, "late", None).await.unwrap(),
            FailureOutcome::NotPending
        );
    }

    #[tokio::test]
    async fn cleanup_keeps_entries_of_records_with_pending_changes() {
        let pool = migrated_pool().await;
        let repo = SqliteOutboxRepository::new(pool.clone());

        let settled = product(1);
        let busy = product(1);
        let old_settled = append(&repo, &pool, Change::Product(settled.clone())).await;
        let old_busy = append(&repo, &pool, Change::Product(busy.clone())).await;
        let pending = append(&repo, &pool, Change::Product(Product { version: 2, ..busy.clone() })).await;
        repo.mark_synced_batch(&[old_settled.sequence_id, old_busy.sequence_id]).await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        assert!(repo.has_unsynced_for_with_tx("products", busy.id, &mut tx).await.unwrap());
        assert!(!repo.has_unsynced_for_with_tx("products", settled.id, &mut tx).await.unwrap());
        tx.commit().await.unwrap();

        let removed = repo.cleanup_synced(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(repo.find_for_record("products", settled.id).await.unwrap().is_empty());
        assert_eq!(repo.find_for_record("products", busy.id).await.unwrap().len(), 2);
        assert!(!repo.find_by_sequence_id(pending.sequence_id).await.unwrap().synced);
    }
}
