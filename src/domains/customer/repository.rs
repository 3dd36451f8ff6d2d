use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{query, query_as, query_scalar, QueryBuilder, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::domains::core::repository::{FindById, MergeableEntityRepository};
use crate::domains::customer::types::{Customer, CustomerFilter, CustomerRow, NewCustomer, UpdateCustomer};
use crate::domains::outbox::repository::OutboxRepository;
use crate::domains::outbox::types::{Change, OutboxOperation};
use crate::errors::{DbError, DomainError, DomainResult};
use crate::types::{to_db_timestamp, PaginatedResult, PaginationParams};
use crate::validation::Validate;

const CUSTOMER_COLUMNS: &str =
    "id, name, phone, email, loyalty_points, notes, version, created_at, updated_at, deleted_at";

#[async_trait]
pub trait CustomerRepository: FindById<Customer> + MergeableEntityRepository<Customer> + Send + Sync {
    async fn create(&self, new_customer: &NewCustomer, auth: &AuthContext) -> DomainResult<Customer>;
    async fn create_with_tx<'t>(
        &self,
        new_customer: &NewCustomer,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Customer>;

    async fn update(&self, id: Uuid, update: &UpdateCustomer, auth: &AuthContext) -> DomainResult<Customer>;
    async fn update_with_tx<'t>(
        &self,
        id: Uuid,
        update: &UpdateCustomer,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Customer>;

    async fn delete(&self, id: Uuid, auth: &AuthContext) -> DomainResult<()>;
    async fn delete_with_tx<'t>(
        &self,
        id: Uuid,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    async fn find_all(&self, params: PaginationParams) -> DomainResult<PaginatedResult<Customer>>;

    async fn find_by_filter(
        &self,
        filter: &CustomerFilter,
        params: PaginationParams,
    ) -> DomainResult<PaginatedResult<Customer>>;
}

#[derive(Clone)]
pub struct SqliteCustomerRepository {
    pool: SqlitePool,
    outbox_repo: Arc<dyn OutboxRepository>,
}

impl SqliteCustomerRepository {
    pub fn new(pool: SqlitePool, outbox_repo: Arc<dyn OutboxRepository>) -> Self {
        Self { pool, outbox_repo }
    }

    fn entity_table() -> &'static str {
        "customers"
    }

    async fn find_live_with_tx<'t>(
        &self,
        id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Customer> {
        let sql = format!("SELECT {} FROM customers WHERE id = ?", CUSTOMER_COLUMNS);
        let row = query_as::<_, CustomerRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::EntityNotFound(Self::entity_table().to_string(), id))?;

        let customer = row.into_entity()?;
        if customer.deleted_at.is_some() {
            return Err(DomainError::DeletedEntity(Self::entity_table().to_string(), id));
        }
        Ok(customer)
    }

    async fn write_row_with_tx<'t>(
        &self,
        customer: &Customer,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        query(
            r#"INSERT INTO customers (
                id, name, phone, email, loyalty_points, notes,
                version, created_at, updated_at, deleted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                phone = excluded.phone,
                email = excluded.email,
                loyalty_points = excluded.loyalty_points,
                notes = excluded.notes,
                version = excluded.version,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                deleted_at = excluded.deleted_at"#,
        )
        .bind(customer.id.to_string())
        .bind(&customer.name)
        .bind(&customer.phone)
        .bind(&customer.email)
        .bind(customer.loyalty_points)
        .bind(&customer.notes)
        .bind(customer.version)
        .bind(to_db_timestamp(&customer.created_at))
        .bind(to_db_timestamp(&customer.updated_at))
        .bind(customer.deleted_at.as_ref().map(to_db_timestamp))
        .execute(&mut **tx)
        .await
        .map_err(DbError::from)?;

        Ok(())
    }

    async fn record_mutation_with_tx<'t>(
        &self,
        customer: &Customer,
        operation: OutboxOperation,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        self.write_row_with_tx(customer, tx).await?;
        self.outbox_repo
            .append_with_tx(&Change::Customer(customer.clone()), operation, tx)
            .await?;
        Ok(())
    }

    fn push_filter_conditions(builder: &mut QueryBuilder<'_, Sqlite>, filter: &CustomerFilter) {
        builder.push(" WHERE deleted_at IS NULL");
        if let Some(text) = filter.search_text.as_ref().filter(|t| !t.trim().is_empty()) {
            let pattern = format!("%{}%", text.trim());
            builder.push(" AND (name LIKE ");
            builder.push_bind(pattern.clone());
            builder.push(" OR phone LIKE ");
            builder.push_bind(pattern.clone());
            builder.push(" OR email LIKE ");
            builder.push_bind(pattern);
            builder.push(")");
        }
        if let Some(min_points) = filter.min_loyalty_points {
            builder.push(" AND loyalty_points >= ");
            builder.push_bind(min_points);
        }
    }
}

#[async_trait]
impl FindById<Customer> for SqliteCustomerRepository {
    async fn find_by_id(&self, id: Uuid) -> DomainResult<Customer> {
        let sql = format!("SELECT {} FROM customers WHERE id = ? AND deleted_at IS NULL", CUSTOMER_COLUMNS);
        let row = query_as::<_, CustomerRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::EntityNotFound(Self::entity_table().to_string(), id))?;

        row.into_entity()
    }
}

#[async_trait]
impl MergeableEntityRepository<Customer> for SqliteCustomerRepository {
    fn entity_name(&self) -> &'static str {
        Self::entity_table()
    }

    async fn find_version_with_tx<'t>(
        &self,
        id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<i64>> {
        let version = query_scalar::<_, i64>("SELECT version FROM customers WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(DbError::from)?;
        Ok(version)
    }

    async fn upsert_remote_with_tx<'t>(
        &self,
        entity: &Customer,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        self.write_row_with_tx(entity, tx).await
    }
}

#[async_trait]
impl CustomerRepository for SqliteCustomerRepository {
    async fn create(&self, new_customer: &NewCustomer, auth: &AuthContext) -> DomainResult<Customer> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        match self.create_with_tx(new_customer, auth, &mut tx).await {
            Ok(customer) => {
                tx.commit().await.map_err(DbError::from)?;
                Ok(customer)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn create_with_tx<'t>(
        &self,
        new_customer: &NewCustomer,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Customer> {
        new_customer.validate()?;

        let now = Utc::now();
        let customer = Customer {
            id: Uuid::new_v4(),
            name: new_customer.name.trim().to_string(),
            phone: new_customer.phone.clone(),
            email: new_customer.email.clone(),
            loyalty_points: 0,
            notes: new_customer.notes.clone(),
            version: 1,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        self.record_mutation_with_tx(&customer, OutboxOperation::Insert, tx).await?;
        log::debug!("Customer {} created by terminal {}", customer.id, auth.terminal_id);
        Ok(customer)
    }

    async fn update(&self, id: Uuid, update: &UpdateCustomer, auth: &AuthContext) -> DomainResult<Customer> {
        let mut tx = self.pool.begin().await.map_err(DbError::from)?;
        match self.update_with_tx(id, update, auth, &mut tx).await {
            Ok(customer) => {
                tx.commit().await.map_err(DbError::from)?;
                Ok(customer)
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
        update: &UpdateCustomer,
        auth: &AuthContext,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Customer> {
        update.validate()?;
        let mut customer = self.find_live_with_tx(id, tx).await?;
        if !customer.apply_update(update) {
            return Ok(customer);
        }

        customer.version += 1;
        customer.updated_at = Utc::now();
        self.record_mutation_with_tx(&customer, OutboxOperation::Update, tx).await?;
        log::debug!("Customer {} updated to version {} by {}", id, customer.version, auth.terminal_id);
        Ok(customer)
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
        let mut customer = self.find_live_with_tx(id, tx).await?;
        let now = Utc::now();
        customer.version += 1;
        customer.updated_at = now;
        customer.deleted_at = Some(now);

        self.record_mutation_with_tx(&customer, OutboxOperation::Delete, tx).await?;
        log::debug!("Customer {} deleted by {}", id, auth.terminal_id);
        Ok(())
    }

    async fn find_all(&self, params: PaginationParams) -> DomainResult<PaginatedResult<Customer>> {
        self.find_by_filter(&CustomerFilter::default(), params).await
    }

    async fn find_by_filter(
        &self,
        filter: &CustomerFilter,
        params: PaginationParams,
    ) -> DomainResult<PaginatedResult<Customer>> {
        let mut count_builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM customers");
        Self::push_filter_conditions(&mut count_builder, filter);
        let total = count_builder
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM customers", CUSTOMER_COLUMNS));
        Self::push_filter_conditions(&mut builder, filter);
        builder.push(" ORDER BY name ASC, id ASC LIMIT ");
        builder.push_bind(params.limit());
        builder.push(" OFFSET ");
        builder.push_bind(params.offset());

        let items = builder
            .build_query_as::<CustomerRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?
            .into_iter()
            .map(CustomerRow::into_entity)
            .collect::<DomainResult<Vec<_>>>()?;

        Ok(PaginatedResult::new(items, total as u64, params))
    }
}
