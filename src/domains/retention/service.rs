use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{query, SqlitePool};

use crate::domains::outbox::repository::OutboxRepository;
use crate::domains::outbox::types::Change;
use crate::domains::sync::repository::{
    SyncStateRepository, OUTBOX_RETENTION_DAYS_SETTING, RETENTION_DAYS_SETTING,
};
use crate::errors::{DbError, DomainError, DomainResult, ValidationError};
use crate::types::to_db_timestamp;

/// Counts of rows removed by one retention pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    /// Completed or voided sales past the retention window
    pub sales_pruned: u64,
    /// Soft-deleted rows of any entity table past the window
    pub tombstones_pruned: u64,
    pub outbox_entries_pruned: u64,
}

impl PruneReport {
    pub fn total(&self) -> u64 {
        self.sales_pruned + self.tombstones_pruned + self.outbox_entries_pruned
    }
}

/// Bounds local storage by removing old, fully synced history.
///
/// A record is never removed while any unsynced outbox entry (dead-lettered
/// included) still references it.
pub struct RetentionService {
    pool: SqlitePool,
    outbox_repo: Arc<dyn OutboxRepository>,
    state_repo: Arc<dyn SyncStateRepository>,
}

impl RetentionService {
    pub fn new(
        pool: SqlitePool,
        outbox_repo: Arc<dyn OutboxRepository>,
        state_repo: Arc<dyn SyncStateRepository>,
    ) -> Self {
        Self { pool, outbox_repo, state_repo }
    }

    pub async fn prune(&self, now: DateTime<Utc>) -> DomainResult<PruneReport> {
        let retention_days = self.state_repo.retention_days().await?;
        let cutoff = to_db_timestamp(&window_start(now, RETENTION_DAYS_SETTING, retention_days)?);

        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        let mut report = PruneReport::default();

        // completed_at falls back to updated_at for rows closed before it was tracked
        let sales = query(
            "DELETE FROM sales
             WHERE status IN ('completed', 'voided')
               AND COALESCE(completed_at, updated_at) < ?
               AND NOT EXISTS (
                   SELECT 1 FROM sync_outbox o
                   WHERE o.table_name = 'sales' AND o.record_id = sales.id AND o.synced = 0
               )",
        )
        .bind(&cutoff)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;
        report.sales_pruned = sales.rows_affected();

        for table in Change::TABLES {
            let sql = format!(
                "DELETE FROM {table}
                 WHERE deleted_at IS NOT NULL
                   AND deleted_at < ?
                   AND NOT EXISTS (
                       SELECT 1 FROM sync_outbox o
                       WHERE o.table_name = '{table}' AND o.record_id = {table}.id AND o.synced = 0
                   )"
            );
            let result = query(&sql)
                .bind(&cutoff)
                .execute(&mut *tx)
                .await
                .map_err(DbError::from)?;
            report.tombstones_pruned += result.rows_affected();
        }

        tx.commit().await.map_err(DbError::from)?;

        let outbox_days = self.state_repo.outbox_retention_days().await?;
        let outbox_cutoff = window_start(now, OUTBOX_RETENTION_DAYS_SETTING, outbox_days)?;
        report.outbox_entries_pruned = self.outbox_repo.cleanup_synced(outbox_cutoff).await?;

        if report.total() > 0 {
            log::info!(
                "Retention removed {} sales, {} tombstones, {} outbox entries",
                report.sales_pruned,
                report.tombstones_pruned,
                report.outbox_entries_pruned
            );
        }
        Ok(report)
    }
}

/// `now` minus `days`, rejecting windows that leave chrono's range
fn window_start(now: DateTime<Utc>, setting: &str, days: i64) -> DomainResult<DateTime<Utc>> {
    Duration::try_days(days)
        .and_then(|window| now.checked_sub_signed(window))
        .ok_or_else(|| {
            DomainError::Validation(ValidationError::invalid_value(
                setting,
                &format!("retention window of {} days is out of range", days),
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::core::repository::FindById;
    use crate::domains::customer::repository::{CustomerRepository, SqliteCustomerRepository};
    use crate::domains::customer::types::NewCustomer;
    use crate::domains::outbox::repository::SqliteOutboxRepository;
    use crate::domains::sale::repository::{SaleRepository, SqliteSaleRepository};
    use crate::domains::sale::types::{NewSale, PaymentMethod, SaleLine};
    use crate::domains::sync::repository::SqliteSyncStateRepository;
    use crate::test_support::{migrated_pool, test_auth};
    use rust_decimal_macros::dec;

    struct Fixture {
        pool: SqlitePool,
        outbox: Arc<SqliteOutboxRepository>,
        sales: SqliteSaleRepository,
        customers: SqliteCustomerRepository,
        retention: RetentionService,
    }

    async fn fixture() -> Fixture {
        let pool = migrated_pool().await;
        let outbox = Arc::new(SqliteOutboxRepository::new(pool.clone()));
        let state = Arc::new(SqliteSyncStateRepository::new(pool.clone()));
        Fixture {
            pool: pool.clone(),
            sales: SqliteSaleRepository::new(pool.clone(), outbox.clone()),
            customers: SqliteCustomerRepository::new(pool.clone(), outbox.clone()),
            retention: RetentionService::new(pool, outbox.clone(), state),
            outbox,
        }
    }

    fn sale(receipt: &str) -> NewSale {
        NewSale {
            receipt_number: receipt.to_string(),
            customer_id: None,
            lines: vec![SaleLine { product_id: None, description: "Tea".into(), quantity: 1, unit_price: dec!(2) }],
            total: dec!(2),
            payment_method: PaymentMethod::Cash,
        }
    }

    async fn sync_everything(outbox: &SqliteOutboxRepository) {
        let ids: Vec<i64> = outbox.list_unsynced(1000).await.unwrap().iter().map(|e| e.sequence_id).collect();
        outbox.mark_synced_batch(&ids).await.unwrap();
    }

    #[tokio::test]
    async fn unsynced_records_survive_retention() {
        let f = fixture().await;
        let auth = test_auth();
        let sale = f.sales.create(&sale("R-1"), &auth).await.unwrap();
        f.sales.complete(sale.id, &auth).await.unwrap();

        // Far in the future, so everything is past the window
        let later = Utc::now() + Duration::days(365);
        let report = f.retention.prune(later).await.unwrap();
        assert_eq!(report.sales_pruned, 0);
        assert!(f.sales.find_by_id(sale.id).await.is_ok());

        // Dead-lettered entries still protect the record
        for entry in f.outbox.list_unsynced(10).await.unwrap() {
            f.outbox.record_failure(entry.sequence_id, "rejected", Some(1)).await.unwrap();
        }
        assert_eq!(f.retention.prune(later).await.unwrap().sales_pruned, 0);
    }

    #[tokio::test]
    async fn synced_history_past_the_window_is_pruned() {
        let f = fixture().await;
        let auth = test_auth();
        let closed = f.sales.create(&sale("R-1"), &auth).await.unwrap();
        f.sales.complete(closed.id, &auth).await.unwrap();
        let open = f.sales.create(&sale("R-2"), &auth).await.unwrap();
        let gone = f
            .customers
            .create(&NewCustomer { name: "Gone".into(), phone: None, email: None, notes: None }, &auth)
            .await
            .unwrap();
        f.customers.delete(gone.id, &auth).await.unwrap();
        sync_everything(&f.outbox).await;

        // Inside the window nothing goes
        assert_eq!(f.retention.prune(Utc::now()).await.unwrap().total(), 0);

        let report = f.retention.prune(Utc::now() + Duration::days(365)).await.unwrap();
        assert_eq!(report.sales_pruned, 1);
        assert_eq!(report.tombstones_pruned, 1);
        assert_eq!(report.outbox_entries_pruned, 5);
        assert!(f.sales.find_by_id(closed.id).await.is_err());
        assert!(f.sales.find_by_id(open.id).await.is_ok());
    }

    #[tokio::test]
    async fn out_of_range_window_is_an_error() {
        let f = fixture().await;
        // Written directly, as an older build or another tool could have done
        sqlx::query("INSERT OR REPLACE INTO sync_settings (key, value, updated_at) VALUES (?, '200000000', ?)")
            .bind(RETENTION_DAYS_SETTING)
            .bind(to_db_timestamp(&Utc::now()))
            .execute(&f.pool)
            .await
            .unwrap();

        let result = f.retention.prune(Utc::now()).await;
        assert!(matches!(result, Err(DomainError::Validation(_))));
        assert!(window_start(Utc::now(), RETENTION_DAYS_SETTING, 36_500).is_ok());
    }
}
