use std::str::FromStr;
use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::auth::IdentityProvider;
use crate::config::CoreConfig;
use crate::db_migration::run_migrations;
use crate::domains::customer::{Customer, CustomerRepository, SqliteCustomerRepository};
use crate::domains::outbox::{OutboxRepository, SqliteOutboxRepository};
use crate::domains::product::{Product, ProductRepository, SqliteProductRepository};
use crate::domains::retention::RetentionService;
use crate::domains::sale::{Sale, SaleRepository, SqliteSaleRepository};
use crate::domains::sync::{
    EntityMerger, HttpSyncClient, RemoteSyncClient, SqliteSyncStateRepository, SyncOptions,
    SyncScheduler, SyncService, SyncServiceImpl, SyncStateRepository, VersionedEntityMerger,
};
use crate::errors::{DbError, DomainError, ServiceError, ServiceResult};

/// Owned handle to one terminal's store and sync engine
#[derive(Clone)]
pub struct PosCore {
    pub config: CoreConfig,
    pub pool: SqlitePool,
    pub outbox_repo: Arc<dyn OutboxRepository>,
    pub sync_state_repo: Arc<dyn SyncStateRepository>,
    pub product_repo: Arc<dyn ProductRepository>,
    pub customer_repo: Arc<dyn CustomerRepository>,
    pub sale_repo: Arc<dyn SaleRepository>,
    pub retention_service: Arc<RetentionService>,
    pub sync_service: Arc<dyn SyncService>,
}

impl PosCore {
    /// Open the database, migrate it and wire the sync engine against the
    /// HTTP remote at `config.api_base_url`.
    pub async fn open(config: CoreConfig, identity: Arc<dyn IdentityProvider>) -> ServiceResult<Self> {
        let remote = Arc::new(HttpSyncClient::new(&config.api_base_url, config.request_timeout)?);
        Self::open_with_remote(config, identity, remote).await
    }

    pub async fn open_with_remote(
        config: CoreConfig,
        identity: Arc<dyn IdentityProvider>,
        remote: Arc<dyn RemoteSyncClient>,
    ) -> ServiceResult<Self> {
        config.validate()?;
        let pool = open_pool(&config.database_url).await?;
        run_migrations(&pool).await.map_err(DomainError::from)?;
        Ok(Self::wire(config, pool, identity, remote))
    }

    fn wire(
        config: CoreConfig,
        pool: SqlitePool,
        identity: Arc<dyn IdentityProvider>,
        remote: Arc<dyn RemoteSyncClient>,
    ) -> Self {
        let outbox_repo: Arc<dyn OutboxRepository> = Arc::new(SqliteOutboxRepository::new(pool.clone()));
        let sync_state_repo: Arc<dyn SyncStateRepository> = Arc::new(SqliteSyncStateRepository::new(pool.clone()));

        let products = Arc::new(SqliteProductRepository::new(pool.clone(), outbox_repo.clone()));
        let customers = Arc::new(SqliteCustomerRepository::new(pool.clone(), outbox_repo.clone()));
        let sales = Arc::new(SqliteSaleRepository::new(pool.clone(), outbox_repo.clone()));

        // Registration order is apply order within a pull page
        let mut entity_merger = EntityMerger::new();
        entity_merger.register_merger(Arc::new(VersionedEntityMerger::<Product>::new(products.clone(), outbox_repo.clone())));
        entity_merger.register_merger(Arc::new(VersionedEntityMerger::<Customer>::new(customers.clone(), outbox_repo.clone())));
        entity_merger.register_merger(Arc::new(VersionedEntityMerger::<Sale>::new(sales.clone(), outbox_repo.clone())));

        let retention_service = Arc::new(RetentionService::new(
            pool.clone(),
            outbox_repo.clone(),
            sync_state_repo.clone(),
        ));

        let sync_service: Arc<dyn SyncService> = Arc::new(SyncServiceImpl::new(
            pool.clone(),
            outbox_repo.clone(),
            sync_state_repo.clone(),
            Arc::new(entity_merger),
            remote,
            identity,
            retention_service.clone(),
            SyncOptions::from(&config),
        ));

        log::info!("POS core ready (remote {})", config.api_base_url);

        Self {
            config,
            pool,
            outbox_repo,
            sync_state_repo,
            product_repo: products,
            customer_repo: customers,
            sale_repo: sales,
            retention_service,
            sync_service,
        }
    }

    /// Start the periodic sync task. Send on (or drop) the returned sender to stop it.
    pub fn spawn_scheduler(&self) -> (JoinHandle<()>, oneshot::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let scheduler = SyncScheduler::from_config(self.sync_service.clone(), &self.config)
            .with_shutdown_signal(shutdown_rx);
        (tokio::spawn(scheduler.start()), shutdown_tx)
    }
}

/// One long-lived connection: every read and write for the terminal
/// serializes through it.
async fn open_pool(database_url: &str) -> ServiceResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(db_failure)?
        .create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(|e| {
            log::error!("Database connection failed: {}", e);
            db_failure(e)
        })
}

fn db_failure(error: sqlx::Error) -> ServiceError {
    ServiceError::Domain(DomainError::Database(DbError::from(error)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::product::NewProduct;
    use crate::domains::sync::remote_client::MockRemote;
    use crate::domains::sync::CycleStatus;
    use crate::test_support::{signed_in_identity, test_auth};
    use rust_decimal_macros::dec;

    fn file_config(dir: &tempfile::TempDir) -> CoreConfig {
        CoreConfig {
            database_url: format!("sqlite://{}", dir.path().join("pos.sqlite").display()),
            ..CoreConfig::default()
        }
    }

    #[tokio::test]
    async fn outbox_survives_reopening_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(MockRemote::new());

        let core = PosCore::open_with_remote(file_config(&dir), signed_in_identity(), remote.clone())
            .await
            .unwrap();
        let product = core
            .product_repo
            .create(
                &NewProduct {
                    sku: "P1".into(),
                    name: "Coffee".into(),
                    price: dec!(3.20),
                    stock_quantity: 5,
                    category: None,
                    barcode: None,
                },
                &test_auth(),
            )
            .await
            .unwrap();
        core.pool.close().await;

        let reopened = PosCore::open_with_remote(file_config(&dir), signed_in_identity(), remote.clone())
            .await
            .unwrap();
        assert_eq!(reopened.outbox_repo.count_unsynced().await.unwrap(), 1);

        let report = reopened.sync_service.sync().await.unwrap();
        assert_eq!(report.push.unwrap().marked_synced, 1);
        assert_eq!(report.pull.status, CycleStatus::Completed);
        assert!(remote.record("products", product.id).is_some());
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_opening() {
        let config = CoreConfig { push_batch_size: 0, ..CoreConfig::default() };
        let result = PosCore::open_with_remote(config, signed_in_identity(), Arc::new(MockRemote::new())).await;
        assert!(matches!(result, Err(ServiceError::Configuration(_))));
    }

    #[tokio::test]
    async fn scheduler_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let config = CoreConfig { warmup_delay: std::time::Duration::ZERO, ..file_config(&dir) };
        let core = PosCore::open_with_remote(config, signed_in_identity(), Arc::new(MockRemote::new()))
            .await
            .unwrap();

        let (handle, shutdown) = core.spawn_scheduler();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown.send(()).unwrap();
        handle.await.unwrap();
        assert!(core.sync_state_repo.last_pull_at().await.unwrap().is_some());
    }
}
