use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{query, query_as, query_scalar, QueryBuilder, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::core::repository::{FindById, MergeableEntityRepository};
use crate::domains::outbox::repository::OutboxRepository;
use crate::domains::outbox::types::{Change, OutboxOperation};
use crate::domains::sale::types::{NewSale, Sale, SaleFilter, SaleRow, SaleStatus, UpdateSale};
use crate::errors::{DbError, DomainError, DomainResult, ValidationError};
use crate::types::{to_db_timestamp, PaginatedResult, PaginationParams};
use crate::validation::{validate_unique, Validate};

const SALE_COLUMNS: &str = "id, receipt_number, customer_id, lines, total, payment_method, status, \
    completed_at, version, created_at, updated_at, deleted_at";

/// Trait defining sale repository operations
#[async_trait]
pub trait SaleRepository: FindById<Sale> + MergeableEntityRepository<Sale> + Send + Sync {
    async fn create(&self, new_sale: &NewSale, auth: &AuthContext) -> DomainResult<Sale>;
    async fn create_with_tx<'t>(
        &self,
        new_sale: &NewSale,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Sale>;

    /// Edit an open sale
    async fn update(&self, id: Uuid, update: &UpdateSale, auth: &AuthContext) -> DomainResult<Sale>;
    async fn update_with_tx<'t>(
        &self,
        id: Uuid,
        update: &UpdateSale,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Sale>;

    /// Close an open sale as paid
    async fn complete(&self, id: Uuid, auth: &AuthContext) -> DomainResult<Sale>;

    /// Cancel a sale, open or completed
    async fn void(&self, id: Uuid, auth: &AuthContext) -> DomainResult<Sale>;

    async fn delete(&self, id: Uuid, auth: &AuthContext) -> DomainResult<()>;
    async fn delete_with_tx<'t>(
        &self,
        id: Uuid,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    async fn find_all(&self, params: PaginationParams) -> DomainResult<PaginatedResult<Sale>>;

    async fn find_by_filter(
        &self,
        filter: &SaleFilter,
        params: PaginationParams,
    ) -> DomainResult<PaginatedResult<Sale>>;
}

#[derive(Clone)]
pub struct SqliteSaleRepository {
    pool: SqlitePool,
    outbox_repo: Arc<dyn OutboxRepository>,
}

impl SqliteSaleRepository {
    pub fn new(pool: SqlitePool, outbox_repo: Arc<dyn OutboxRepository>) -> Self {
        Self { pool, outbox_repo }
    }

    fn entity_table() -> &'static str {
        "sales"
    }

    async fn find_live_with_tx<'t>(&self, id: Uuid, tx: &mut Transaction<'t, Sqlite>) -> DomainResult<Sale> {
        let sql = format!("SELECT {} FROM sales WHERE id = ?", SALE_COLUMNS);
        let sale = query_as::<_, SaleRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::EntityNotFound(Self::entity_table().to_string(), id))?
            .into_entity()?;

        if sale.deleted_at.is_some() {
            return Err(DomainError::DeletedEntity(Self::entity_table().to_string(), id));
        }
        Ok(sale)
    }

    async fn write_row_with_tx<'t>(&self, sale: &Sale, tx: &mut Transaction<'t, Sqlite>) -> DomainResult<()> {
        let lines_json = serde_json::to_string(&sale.lines)?;
        query(
            r#"INSERT INTO sales (
                id, receipt_number, customer_id, lines, total, payment_method, status,
                completed_at, version, created_at, updated_at, deleted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                receipt_number = excluded.receipt_number,
                customer_id = excluded.customer_id,
                lines = excluded.lines,
                total = excluded.total,
                payment_method = excluded.payment_method,
                status = excluded.status,
                completed_at = excluded.completed_at,
                version = excluded.version,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at"#,
        )
        .bind(sale.id.to_string())
        .bind(&sale.receipt_number)
        .bind(sale.customer_id.map(|id| id.to_string()))
        .bind(lines_json)
        .bind(sale.total.to_string())
        .bind(sale.payment_method.as_str())
        .bind(sale.status.as_str())
        .bind(sale.completed_at.as_ref().map(to_db_timestamp))
        .bind(sale.version)
        .bind(to_db_timestamp(&sale.created_at))
        .bind(to_db_timestamp(&sale.updated_at))
        .bind(sale.deleted_at.as_ref().map(to_db_timestamp))
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    async fn record_mutation_with_tx<'t>(
        &self,
        sale: &Sale,
        operation: OutboxOperation,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        self.write_row_with_tx(sale, tx).await?;
        self.outbox_repo
            .append_with_tx(&Change::Sale(sale.clone()), operation, tx)
            .await?;
        Ok(())
    }

    /// Move a sale to a closed status. `completed_at` keeps the first close time.
    async fn close_with_tx<'t>(
        &self,
        id: Uuid,
        target: SaleStatus,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Sale> {
        let mut sale = self.find_live_with_tx(id, tx).await?;
        match (sale.status, target) {
            (SaleStatus::Open, _) | (SaleStatus::Completed, SaleStatus::Voided) => {}
            (current, _) => {
                return Err(DomainError::Validation(ValidationError::invalid_value(
                    "status",
                    &format!("cannot move a {} sale to {}", current, target),
                )))
            }
        }

        let now = Utc::now();
        sale.status = target;
        sale.completed_at.get_or_insert(now);
        sale.version += 1;
        sale.updated_at = now;
        self.record_mutation_with_tx(&sale, OutboxOperation::Update, tx).await?;
        Ok(sale)
    }

    async fn close(&self, id: Uuid, target: SaleStatus, auth: &AuthContext) -> DomainResult<Sale> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        match self.close_with_tx(id, target, &mut tx).await {
            Ok(sale) => {
                tx.commit().await.map_err(DbError::from)?;
                log::info!("Sale {} {} by terminal {}", sale.receipt_number, target, auth.terminal_id);
                Ok(sale)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    fn push_filter_conditions(builder: &mut QueryBuilder<'_, Sqlite>, filter: &SaleFilter) {
        builder.push(" WHERE deleted_at IS NULL");
        if let Some(status) = filter.status {
            builder.push(" AND status = ");
            builder.push_bind(status.as_str());
        }
        if let Some(customer_id) = filter.customer_id {
            builder.push(" AND customer_id = ");
            builder.push_bind(customer_id.to_string());
        }
        if let Some(from) = &filter.created_from {
            builder.push(" AND created_at >= ");
            builder.push_bind(to_db_timestamp(from));
        }
        if let Some(to) = &filter.created_to {
            builder.push(" AND created_at < ");
            builder.push_bind(to_db_timestamp(to));
        }
    }
}

#[async_trait]
impl FindById<Sale> for SqliteSaleRepository {
    async fn find_by_id(&self, id: Uuid) -> DomainResult<Sale> {
        let sql = format!("SELECT {} FROM sales WHERE id = ? AND deleted_at IS NULL", SALE_COLUMNS);
        query_as::<_, SaleRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::EntityNotFound(Self::entity_table().to_string(), id))?
            .into_entity()
    }
}

#[async_trait]
impl MergeableEntityRepository<Sale> for SqliteSaleRepository {
    fn entity_name(&self) -> &'static str {
        Self::entity_table()
    }

    async fn find_version_with_tx<'t>(
        &self,
        id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<i64>> {
        let version = query_scalar::<_, i64>("SELECT version FROM sales WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(DbError::from)?;
        Ok(version)
    }

    async fn upsert_remote_with_tx<'t>(&self, entity: &Sale, tx: &mut Transaction<'t, Sqlite>) -> DomainResult<()> {
        self.write_row_with_tx(entity, tx).await
    }
}

#[async_trait]
impl SaleRepository for SqliteSaleRepository {
    async fn create(&self, new_sale: &NewSale, auth: &AuthContext) -> DomainResult<Sale> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        match self.create_with_tx(new_sale, auth, &mut tx).await {
            Ok(sale) => {
                tx.commit().await.map_err(DbError::from)?;
                Ok(sale)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn create_with_tx<'t>(
        &self,
        new_sale: &NewSale,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Sale> {
        new_sale.validate()?;
        let receipt_number = new_sale.receipt_number.trim().to_string();
        validate_unique(&mut **tx, "sales", "receipt_number", &receipt_number, None, "receipt_number").await?;

        let now = Utc::now();
        let sale = Sale {
            id: Uuid::new_v4(),
            receipt_number,
            customer_id: new_sale.customer_id,
            total: new_sale.total,
            lines: new_sale.lines.clone(),
            payment_method: new_sale.payment_method,
            status: SaleStatus::Open,
            completed_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        self.record_mutation_with_tx(&sale, OutboxOperation::Insert, tx).await?;
        log::debug!("Sale {} opened by terminal {}", sale.receipt_number, auth.terminal_id);
        Ok(sale)
    }

    async fn update(&self, id: Uuid, update: &UpdateSale, auth: &AuthContext) -> DomainResult<Sale> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        match self.update_with_tx(id, update, auth, &mut tx).await {
            Ok(sale) => {
                tx.commit().await.map_err(DbError::from)?;
                Ok(sale)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn update_with_tx<'t>(
        &self,
        id: Uuid,
        update: &UpdateSale,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Sale> {
        update.validate()?;
        let mut sale = self.find_live_with_tx(id, tx).await?;
        sale.ensure_open()?;
        if !sale.apply_update(update) {
            return Ok(sale);
        }

        sale.version += 1;
        sale.updated_at = Utc::now();
        self.record_mutation_with_tx(&sale, OutboxOperation::Update, tx).await?;
        log::debug!("Sale {} updated to version {} by {}", id, sale.version, auth.terminal_id);
        Ok(sale)
    }

    async fn complete(&self, id: Uuid, auth: &AuthContext) -> DomainResult<Sale> {
        self.close(id, SaleStatus::Completed, auth).await
    }

    async fn void(&self, id: Uuid, auth: &AuthContext) -> DomainResult<Sale> {
        self.close(id, SaleStatus::Voided, auth).await
    }

    async fn delete(&self, id: Uuid, auth: &AuthContext) -> DomainResult<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        match self.delete_with_tx(id, auth, &mut tx).await {
            Ok(()) => {
                tx.commit().await.map_err(DbError::from)?;
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn delete_with_tx<'t>(
        &self,
        id: Uuid,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let mut sale = self.find_live_with_tx(id, tx).await?;
        let now = Utc::now();
        sale.version += 1;
        sale.updated_at = now;
        sale.deleted_at = Some(now);

        self.record_mutation_with_tx(&sale, OutboxOperation::Delete, tx).await?;
        log::debug!("Sale {} deleted by {}", id, auth.terminal_id);
        Ok(())
    }

    async fn find_all(&self, params: PaginationParams) -> DomainResult<PaginatedResult<Sale>> {
        self.find_by_filter(&SaleFilter::default(), params).await
    }

    async fn find_by_filter(
        &self,
        filter: &SaleFilter,
        params: PaginationParams,
    ) -> DomainResult<PaginatedResult<Sale>> {
        let mut count_builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM sales");
        Self::push_filter_conditions(&mut count_builder, filter);
        let total = count_builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM sales", SALE_COLUMNS));
        Self::push_filter_conditions(&mut builder, filter);
        builder.push(" ORDER BY created_at DESC, id ASC LIMIT ");
        builder.push_bind(params.limit());
        builder.push(" OFFSET ");
        builder.push_bind(params.offset());

        let items = builder
            .build_query_as::<SaleRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?
            .into_iter()
            .map(SaleRow::into_entity)
            .collect::<DomainResult<Vec<_>>>()?;

        Ok(PaginatedResult::new(items, total as u64, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::outbox::repository::SqliteOutboxRepository;
    use crate::domains::sale::types::{PaymentMethod, SaleLine};
    use rust_decimal::Decimal;
    use crate::test_support::{migrated_pool, test_auth};
    use rust_decimal_macros::dec;

    async fn setup() -> (SqliteSaleRepository, Arc<SqliteOutboxRepository>) {
        let pool = migrated_pool().await;
        let outbox = Arc::new(SqliteOutboxRepository::new(pool.clone()));
        (SqliteSaleRepository::new(pool, outbox.clone()), outbox)
    }

    fn new_sale(receipt: &str) -> NewSale {
        NewSale {
            receipt_number: receipt.to_string(),
            customer_id: None,
            lines: vec![SaleLine {
                product_id: None,
                description: "Espresso".into(),
                quantity: 2,
                unit_price: dec!(2.20),
            }],
            total: dec!(4.40),
            payment_method: PaymentMethod::Card,
        }
    }

    #[tokio::test]
    async fn sale_lifecycle_is_captured_in_outbox() {
        let (repo, outbox) = setup().await;
        let auth = test_auth();

        let sale = repo.create(&new_sale("R-0001"), &auth).await.unwrap();
        assert_eq!(sale.total, dec!(4.40));
        assert_eq!(sale.status, SaleStatus::Open);

        let completed = repo.complete(sale.id, &auth).await.unwrap();
        assert_eq!(completed.status, SaleStatus::Completed);
        assert!(completed.completed_at.is_some());
        assert_eq!(completed.version, 2);

        // Closed sales are frozen
        let edit = UpdateSale { payment_method: Some(PaymentMethod::Cash), ..Default::default() };
        assert!(repo.update(sale.id, &edit, &auth).await.is_err());
        assert!(repo.complete(sale.id, &auth).await.is_err());

        let voided = repo.void(sale.id, &auth).await.unwrap();
        assert_eq!(voided.status, SaleStatus::Voided);
        assert_eq!(voided.completed_at, completed.completed_at);

        let entries = outbox.find_for_record("sales", sale.id).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].change().unwrap(), Change::Sale(voided));
    }

    #[tokio::test]
    async fn edited_lines_keep_the_supplied_total() {
        let (repo, _) = setup().await;
        let auth = test_auth();
        let sale = repo.create(&new_sale("R-0002"), &auth).await.unwrap();

        let lines = vec![SaleLine {
            product_id: None,
            description: "Muffin".into(),
            quantity: 3,
            unit_price: dec!(1.10),
        }];
        let updated = repo
            .update(sale.id, &UpdateSale { lines: Some(lines.clone()), ..Default::default() }, &auth)
            .await
            .unwrap();
        assert_eq!(updated.lines, lines);
        assert_eq!(updated.total, dec!(4.40));

        let repriced = repo
            .update(sale.id, &UpdateSale { total: Some(dec!(3.00)), ..Default::default() }, &auth)
            .await
            .unwrap();
        assert_eq!(repriced.total, dec!(3.00));
        assert_eq!(repriced.version, 3);
        assert_eq!(repo.find_by_id(sale.id).await.unwrap(), repriced);
    }

    #[tokio::test]
    async fn oversized_line_is_stored_without_overflow() {
        let (repo, outbox) = setup().await;
        let auth = test_auth();
        let mut big = new_sale("R-BIG");
        big.lines[0].quantity = i64::MAX;
        big.lines[0].unit_price = Decimal::MAX;
        big.total = dec!(99.99);

        let sale = repo.create(&big, &auth).await.unwrap();
        assert_eq!(sale.total, dec!(99.99));
        assert_eq!(repo.find_by_id(sale.id).await.unwrap().lines[0].unit_price, Decimal::MAX);
        assert_eq!(outbox.count_unsynced().await.unwrap(), 1);

        let mut negative = new_sale("R-NEG");
        negative.total = dec!(-1);
        assert!(repo.create(&negative, &auth).await.is_err());
        assert_eq!(outbox.count_unsynced().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn receipt_numbers_are_unique_and_filterable() {
        let (repo, outbox) = setup().await;
        let auth = test_auth();
        let a = repo.create(&new_sale("R-1"), &auth).await.unwrap();
        repo.create(&new_sale("R-2"), &auth).await.unwrap();
        assert!(repo.create(&new_sale("R-1"), &auth).await.is_err());
        assert_eq!(outbox.count_unsynced().await.unwrap(), 2);

        repo.complete(a.id, &auth).await.unwrap();
        let completed = repo
            .find_by_filter(&SaleFilter { status: Some(SaleStatus::Completed), ..Default::default() }, PaginationParams::default())
            .await
            .unwrap();
        assert_eq!(completed.total, 1);
        assert_eq!(completed.items[0].id, a.id);

        let window = repo
            .find_by_filter(
                &SaleFilter { created_to: Some(a.created_at), ..Default::default() },
                PaginationParams::default(),
            )
            .await
            .unwrap();
        assert_eq!(window.total, 0);

        repo.delete(a.id, &auth).await.unwrap();
        assert_eq!(repo.find_all(PaginationParams::default()).await.unwrap().total, 1);
    }
}
