use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{query, query_as, QueryBuilder, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::core::repository::{FindById, MergeableEntityRepository};
use crate::domains::outbox::repository::OutboxRepository;
use crate::domains::outbox::types::{Change, OutboxOperation};
use crate::domains::product::types::{NewProduct, Product, ProductFilter, ProductRow, UpdateProduct};
use crate::errors::{DbError, DomainError, DomainResult, ValidationError};
use crate::types::{to_db_timestamp, PaginatedResult, PaginationParams};
use crate::validation::{validate_unique, Validate};

const PRODUCT_COLUMNS: &str = "id, sku, name, price, stock_quantity, category, barcode, active, \
    version, created_at, updated_at, deleted_at";

/// Trait defining product repository operations
#[async_trait]
pub trait ProductRepository: FindById<Product> + MergeableEntityRepository<Product> + Send + Sync {
    async fn create(&self, new_product: &NewProduct, auth: &AuthContext) -> DomainResult<Product>;
    async fn create_with_tx<'t>(
        &self,
        new_product: &NewProduct,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Product>;

    async fn update(&self, id: Uuid, update: &UpdateProduct, auth: &AuthContext) -> DomainResult<Product>;
    async fn update_with_tx<'t>(
        &self,
        id: Uuid,
        update: &UpdateProduct,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Product>;

    /// Add `delta` (may be negative) to the stock level
    async fn adjust_stock(&self, id: Uuid, delta: i64, auth: &AuthContext) -> DomainResult<Product>;
    async fn adjust_stock_with_tx<'t>(
        &self,
        id: Uuid,
        delta: i64,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Product>;

    /// Soft delete; the tombstone is synced like any other change
    async fn delete(&self, id: Uuid, auth: &AuthContext) -> DomainResult<()>;
    async fn delete_with_tx<'t>(
        &self,
        id: Uuid,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    async fn find_by_sku(&self, sku: &str) -> DomainResult<Option<Product>>;

    async fn find_all(&self, params: PaginationParams) -> DomainResult<PaginatedResult<Product>>;

    async fn find_by_filter(
        &self,
        filter: &ProductFilter,
        params: PaginationParams,
    ) -> DomainResult<PaginatedResult<Product>>;
}

/// SQLite implementation for ProductRepository
#[derive(Clone)]
pub struct SqliteProductRepository {
    pool: SqlitePool,
    outbox_repo: Arc<dyn OutboxRepository>,
}

impl SqliteProductRepository {
    pub fn new(pool: SqlitePool, outbox_repo: Arc<dyn OutboxRepository>) -> Self {
        Self { pool, outbox_repo }
    }

    fn entity_table() -> &'static str {
        "products"
    }

    /// Fetch a row regardless of its deleted state
    async fn find_row_with_tx<'t>(
        &self,
        id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<Product>> {
        let sql = format!("SELECT {} FROM products WHERE id = ?", PRODUCT_COLUMNS);
        let row = query_as::<_, ProductRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(DbError::from)?;

        row.map(ProductRow::into_entity).transpose()
    }

    async fn find_live_with_tx<'t>(
        &self,
        id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Product> {
        match self.find_row_with_tx(id, tx).await? {
            Some(product) if product.deleted_at.is_none() => Ok(product),
            Some(_) => Err(DomainError::DeletedEntity(Self::entity_table().to_string(), id)),
            None => Err(DomainError::EntityNotFound(Self::entity_table().to_string(), id)),
        }
    }

    async fn write_row_with_tx<'t>(
        &self,
        product: &Product,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        query(
            r#"INSERT INTO products (
                id, sku, name, price, stock_quantity, category, barcode, active,
                version, created_at, updated_at, deleted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                sku = excluded.sku,
                name = excluded.name,
                price = excluded.price,
                stock_quantity = excluded.stock_quantity,
                category = excluded.category,
                barcode = excluded.barcode,
                active = excluded.active,
                version = excluded.version,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at"#,
        )
        .bind(product.id.to_string())
        .bind(&product.sku)
        .bind(&product.name)
        .bind(product.price.to_string())
        .bind(product.stock_quantity)
        .bind(&product.category)
        .bind(&product.barcode)
        .bind(product.active as i64)
        .bind(product.version)
        .bind(to_db_timestamp(&product.created_at))
        .bind(to_db_timestamp(&product.updated_at))
        .bind(product.deleted_at.as_ref().map(to_db_timestamp))
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    /// Persist a local mutation together with its outbox entry
    async fn record_mutation_with_tx<'t>(
        &self,
        product: &Product,
        operation: OutboxOperation,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        self.write_row_with_tx(product, tx).await?;
        self.outbox_repo
            .append_with_tx(&Change::Product(product.clone()), operation, tx)
            .await?;
        Ok(())
    }

    fn push_filter_conditions(builder: &mut QueryBuilder<'_, Sqlite>, filter: &ProductFilter) {
        builder.push(" WHERE deleted_at IS NULL");

        if let Some(text) = filter.search_text.as_ref().filter(|t| !t.trim().is_empty()) {
            let pattern = format!("%{}%", text.trim());
            builder.push(" AND (name LIKE ");
            builder.push_bind(pattern.clone());
            builder.push(" OR sku LIKE ");
            builder.push_bind(pattern.clone());
            builder.push(" OR barcode LIKE ");
            builder.push_bind(pattern);
            builder.push(")");
        }
        if let Some(category) = &filter.category {
            builder.push(" AND category = ");
            builder.push_bind(category.clone());
        }
        if let Some(active) = filter.active {
            builder.push(" AND active = ");
            builder.push_bind(active as i64);
        }
        if let Some(max_stock) = filter.max_stock {
            builder.push(" AND stock_quantity <= ");
            builder.push_bind(max_stock);
        }
    }
}

#[async_trait]
impl FindById<Product> for SqliteProductRepository {
    async fn find_by_id(&self, id: Uuid) -> DomainResult<Product> {
        let sql = format!("SELECT {} FROM products WHERE id = ? AND deleted_at IS NULL", PRODUCT_COLUMNS);
        let row = query_as::<_, ProductRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::EntityNotFound(Self::entity_table().to_string(), id))?;

        row.into_entity()
    }
}

#[async_trait]
impl MergeableEntityRepository<Product> for SqliteProductRepository {
    fn entity_name(&self) -> &'static str {
        Self::entity_table()
    }

    async fn find_version_with_tx<'t>(
        &self,
        id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<i64>> {
        let version = sqlx::query_scalar::<_, i64>("SELECT version FROM products WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(DbError::from)?;
        Ok(version)
    }

    async fn upsert_remote_with_tx<'t>(
        &self,
        entity: &Product,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        self.write_row_with_tx(entity, tx).await
    }
}

#[async_trait]
impl ProductRepository for SqliteProductRepository {
    async fn create(&self, new_product: &NewProduct, auth: &AuthContext) -> DomainResult<Product> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        match self.create_with_tx(new_product, auth, &mut tx).await {
            Ok(product) => {
                tx.commit().await.map_err(DbError::from)?;
                Ok(product)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn create_with_tx<'t>(
        &self,
        new_product: &NewProduct,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Product> {
        new_product.validate()?;
        let sku = new_product.sku.trim().to_string();
        validate_unique(&mut **tx, "products", "sku", &sku, None, "sku").await?;

        let now = Utc::now();
        let product = Product {
            id: Uuid::new_v4(),
            sku,
            name: new_product.name.trim().to_string(),
            price: new_product.price,
            stock_quantity: new_product.stock_quantity,
            category: new_product.category.clone(),
            barcode: new_product.barcode.clone(),
            active: true,
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        self.record_mutation_with_tx(&product, OutboxOperation::Insert, tx).await?;
        log::debug!("Product {} created by terminal {}", product.id, auth.terminal_id);
        Ok(product)
    }

    async fn update(&self, id: Uuid, update: &UpdateProduct, auth: &AuthContext) -> DomainResult<Product> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        match self.update_with_tx(id, update, auth, &mut tx).await {
            Ok(product) => {
                tx.commit().await.map_err(DbError::from)?;
                Ok(product)
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
        update: &UpdateProduct,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Product> {
        update.validate()?;
        let mut product = self.find_live_with_tx(id, tx).await?;

        if let Some(sku) = &update.sku {
            let id_str = id.to_string();
            validate_unique(&mut **tx, "products", "sku", sku.trim(), Some(&id_str), "sku").await?;
        }

        if !product.apply_update(update) {
            // Nothing changed: no version bump, no outbox entry
            return Ok(product);
        }

        product.version += 1;
        product.updated_at = Utc::now();
        self.record_mutation_with_tx(&product, OutboxOperation::Update, tx).await?;
        log::debug!("Product {} updated to version {} by {}", id, product.version, auth.terminal_id);
        Ok(product)
    }

    async fn adjust_stock(&self, id: Uuid, delta: i64, auth: &AuthContext) -> DomainResult<Product> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        match self.adjust_stock_with_tx(id, delta, auth, &mut tx).await {
            Ok(product) => {
                tx.commit().await.map_err(DbError::from)?;
                Ok(product)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn adjust_stock_with_tx<'t>(
        &self,
        id: Uuid,
        delta: i64,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Product> {
        if delta == 0 {
            return Err(DomainError::Validation(ValidationError::invalid_value("delta", "must not be zero")));
        }
        let current = self.find_live_with_tx(id, tx).await?;
        let quantity = current.stock_quantity.checked_add(delta).ok_or_else(|| {
            DomainError::Validation(ValidationError::invalid_value(
                "delta",
                &format!("stock of {} cannot change by {}", current.stock_quantity, delta),
            ))
        })?;
        let update = UpdateProduct {
            stock_quantity: Some(quantity),
            ..Default::default()
        };
        self.update_with_tx(id, &update, auth, tx).await
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
        let mut product = self.find_live_with_tx(id, tx).await?;
        let now = Utc::now();
        product.version += 1;
        product.updated_at = now;
        product.deleted_at = Some(now);

        self.record_mutation_with_tx(&product, OutboxOperation::Delete, tx).await?;
        log::debug!("Product {} deleted by {}", id, auth.terminal_id);
        Ok(())
    }

    async fn find_by_sku(&self, sku: &str) -> DomainResult<Option<Product>> {
        let sql = format!("SELECT {} FROM products WHERE sku = ? AND deleted_at IS NULL", PRODUCT_COLUMNS);
        let row = query_as::<_, ProductRow>(&sql)
            .bind(sku)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?;

        row.map(ProductRow::into_entity).transpose()
    }

    async fn find_all(&self, params: PaginationParams) -> DomainResult<PaginatedResult<Product>> {
        self.find_by_filter(&ProductFilter::default(), params).await
    }

    async fn find_by_filter(
        &self,
        filter: &ProductFilter,
        params: PaginationParams,
    ) -> DomainResult<PaginatedResult<Product>> {
        let mut count_builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM products");
        Self::push_filter_conditions(&mut count_builder, filter);
        let total = count_builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM products", PRODUCT_COLUMNS));
        Self::push_filter_conditions(&mut builder, filter);
        builder.push(" ORDER BY name ASC, id ASC LIMIT ");
        builder.push_bind(params.limit());
        builder.push(" OFFSET ");
        builder.push_bind(params.offset());

        let rows = builder
            .build_query_as::<ProductRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;

        let items = rows
            .into_iter()
            .map(ProductRow::into_entity)
            .collect::<DomainResult<Vec<_>>>()?;

        Ok(PaginatedResult::new(items, total as u64, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::outbox::repository::SqliteOutboxRepository;
    use crate::test_support::{migrated_pool, test_auth};
    use rust_decimal_macros::dec;

    async fn setup() -> (SqliteProductRepository, Arc<SqliteOutboxRepository>) {
        let pool = migrated_pool().await;
        let outbox = Arc::new(SqliteOutboxRepository::new(pool.clone()));
        (SqliteProductRepository::new(pool, outbox.clone()), outbox)
    }

    fn new_product(sku: &str) -> NewProduct {
        NewProduct {
            sku: sku.to_string(),
            name: format!("Item {}", sku),
            price: dec!(9.99),
            stock_quantity: 5,
            category: Some("grocery".to_string()),
            barcode: None,
        }
    }

    #[tokio::test]
    async fn create_writes_entity_and_one_outbox_entry() {
        let (repo, outbox) = setup().await;
        let auth = test_auth();

        let product = repo.create(&new_product("P1"), &auth).await.unwrap();
        assert_eq!(product.version, 1);

        let entries = outbox.find_for_record("products", product.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation, OutboxOperation::Insert);
        assert!(!entries[0].synced);
        assert_eq!(entries[0].change().unwrap(), Change::Product(product));
    }

    #[tokio::test]
    async fn update_bumps_version_and_merges_fields() {
        let (repo, outbox) = setup().await;
        let auth = test_auth();
        let product = repo.create(&new_product("P1"), &auth).await.unwrap();

        let updated = repo
            .update(product.id, &UpdateProduct { price: Some(dec!(12.00)), ..Default::default() }, &auth)
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.price, dec!(12.00));
        assert_eq!(updated.name, product.name);

        let adjusted = repo.adjust_stock(product.id, -2, &auth).await.unwrap();
        assert_eq!(adjusted.stock_quantity, 3);
        assert_eq!(adjusted.version, 3);

        assert_eq!(outbox.find_for_record("products", product.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn stock_overflow_is_rejected() {
        let (repo, outbox) = setup().await;
        let auth = test_auth();
        let product = repo.create(&new_product("P1"), &auth).await.unwrap();

        let err = repo.adjust_stock(product.id, i64::MAX, &auth).await.unwrap_err();
        assert!(matches!(err, DomainError::Validation(ValidationError::InvalidValue { .. })));
        assert!(repo.adjust_stock(product.id, i64::MIN, &auth).await.is_ok());
        // Stock now sits at i64::MIN + 5

        let err = repo.adjust_stock(product.id, -6, &auth).await.unwrap_err();
        assert!(matches!(err, DomainError::Validation(ValidationError::InvalidValue { .. })));
        assert_eq!(outbox.find_for_record("products", product.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn noop_update_writes_nothing() {
        let (repo, outbox) = setup().await;
        let auth = test_auth();
        let product = repo.create(&new_product("P1"), &auth).await.unwrap();

        let same = repo.update(product.id, &UpdateProduct::default(), &auth).await.unwrap();
        assert_eq!(same.version, 1);
        assert_eq!(outbox.count_unsynced().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_mutation_leaves_no_outbox_entry() {
        let (repo, outbox) = setup().await;
        let auth = test_auth();
        repo.create(&new_product("DUP"), &auth).await.unwrap();

        let err = repo.create(&new_product("DUP"), &auth).await.unwrap_err();
        assert!(matches!(err, DomainError::Validation(ValidationError::Unique { .. })));
        assert_eq!(outbox.count_unsynced().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_is_a_versioned_tombstone() {
        let (repo, outbox) = setup().await;
        let auth = test_auth();
        let product = repo.create(&new_product("P1"), &auth).await.unwrap();

        repo.delete(product.id, &auth).await.unwrap();
        assert!(matches!(repo.find_by_id(product.id).await, Err(DomainError::EntityNotFound(_, _))));

        let entries = outbox.find_for_record("products", product.id).await.unwrap();
        assert_eq!(entries.last().unwrap().operation, OutboxOperation::Delete);
        let tombstone = entries.last().unwrap().change().unwrap();
        assert!(tombstone.is_deleted());
        assert_eq!(tombstone.version(), 2);

        // A deleted row can be neither updated nor deleted again
        assert!(matches!(
            repo.update(product.id, &UpdateProduct { name: Some("x".into()), ..Default::default() }, &auth).await,
            Err(DomainError::DeletedEntity(_, _))
        ));
    }

    #[tokio::test]
    async fn filter_by_predicate() {
        let (repo, _) = setup().await;
        let auth = test_auth();
        repo.create(&new_product("A-1"), &auth).await.unwrap();
        let low = repo.create(&NewProduct { stock_quantity: 1, ..new_product("B-2") }, &auth).await.unwrap();
        repo.create(&NewProduct { category: Some("bakery".into()), ..new_product("C-3") }, &auth).await.unwrap();

        let low_stock = repo
            .find_by_filter(&ProductFilter { max_stock: Some(2), ..Default::default() }, PaginationParams::default())
            .await
            .unwrap();
        assert_eq!(low_stock.total, 1);
        assert_eq!(low_stock.items[0].id, low.id);

        let grocery = repo
            .find_by_filter(&ProductFilter { category: Some("grocery".into()), ..Default::default() }, PaginationParams::default())
            .await
            .unwrap();
        assert_eq!(grocery.total, 2);

        let search = repo
            .find_by_filter(&ProductFilter { search_text: Some("C-3".into()), ..Default::default() }, PaginationParams::default())
            .await
            .unwrap();
        assert_eq!(search.items.len(), 1);

        let page = repo.find_all(PaginationParams::new(2, 2)).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 1);
        assert!(repo.find_by_sku("A-1").await.unwrap().is_some());
    }
}
