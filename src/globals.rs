use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use sqlx::SqlitePool;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::auth::IdentityProvider;
use crate::config::CoreConfig;
use crate::domains::customer::CustomerRepository;
use crate::domains::outbox::OutboxRepository;
use crate::domains::product::ProductRepository;
use crate::domains::retention::RetentionService;
use crate::domains::sale::SaleRepository;
use crate::domains::sync::{SyncService, SyncStateRepository};
use crate::errors::{ServiceError, ServiceResult};
use crate::runtime::PosCore;

// Global state definitions
lazy_static! {
    static ref INIT_MUTEX: tokio::sync::Mutex<()> = tokio::sync::Mutex::new(());
    static ref INITIALIZED: AtomicBool = AtomicBool::new(false);

    static ref CORE: Mutex<Option<PosCore>> = Mutex::new(None);
    static ref SCHEDULER: Mutex<Option<(JoinHandle<()>, oneshot::Sender<()>)>> = Mutex::new(None);
}

fn not_initialized(what: &str) -> ServiceError {
    ServiceError::Configuration(format!("{} not initialized; call initialize first", what))
}

fn lock_poisoned(what: &str) -> ServiceError {
    ServiceError::Configuration(format!("{} lock poisoned", what))
}

/// Open the terminal database and wire all services into process globals.
/// Repeated calls after a successful one are no-ops.
pub async fn initialize(config: CoreConfig, identity: Arc<dyn IdentityProvider>) -> ServiceResult<()> {
    let _guard = INIT_MUTEX.lock().await;
    if INITIALIZED.load(Ordering::Acquire) {
        log::debug!("Core already initialized");
        return Ok(());
    }

    log::info!("Initializing POS core");
    let core = PosCore::open(config, identity).await?;
    *CORE.lock().map_err(|_| lock_poisoned("CORE"))? = Some(core);
    INITIALIZED.store(true, Ordering::Release);
    Ok(())
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

pub fn get_core() -> ServiceResult<PosCore> {
    CORE.lock()
        .map_err(|_| lock_poisoned("CORE"))?
        .clone()
        .ok_or_else(|| not_initialized("Core"))
}

pub fn get_db_pool() -> ServiceResult<SqlitePool> {
    Ok(get_core()?.pool)
}

pub fn get_config() -> ServiceResult<CoreConfig> {
    Ok(get_core()?.config)
}

pub fn get_outbox_repo() -> ServiceResult<Arc<dyn OutboxRepository>> {
    Ok(get_core()?.outbox_repo)
}

pub fn get_sync_state_repo() -> ServiceResult<Arc<dyn SyncStateRepository>> {
    Ok(get_core()?.sync_state_repo)
}

pub fn get_product_repo() -> ServiceResult<Arc<dyn ProductRepository>> {
    Ok(get_core()?.product_repo)
}

pub fn get_customer_repo() -> ServiceResult<Arc<dyn CustomerRepository>> {
    Ok(get_core()?.customer_repo)
}

pub fn get_sale_repo() -> ServiceResult<Arc<dyn SaleRepository>> {
    Ok(get_core()?.sale_repo)
}

pub fn get_retention_service() -> ServiceResult<Arc<RetentionService>> {
    Ok(get_core()?.retention_service)
}

pub fn get_sync_service() -> ServiceResult<Arc<dyn SyncService>> {
    Ok(get_core()?.sync_service)
}

/// Start the background sync scheduler if it is not already running.
/// Must be called from within a tokio runtime.
pub fn start_sync_scheduler() -> ServiceResult<()> {
    let core = get_core()?;
    let mut slot = SCHEDULER.lock().map_err(|_| lock_poisoned("SCHEDULER"))?;
    if let Some((handle, _)) = slot.as_ref() {
        if !handle.is_finished() {
            log::debug!("Sync scheduler already running");
            return Ok(());
        }
    }
    *slot = Some(core.spawn_scheduler());
    Ok(())
}

/// Signal the scheduler to stop. The running cycle, if any, finishes first.
pub fn stop_sync_scheduler() -> ServiceResult<()> {
    let mut slot = SCHEDULER.lock().map_err(|_| lock_poisoned("SCHEDULER"))?;
    if let Some((_, shutdown)) = slot.take() {
        let _ = shutdown.send(());
        log::info!("Sync scheduler stop requested");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getters_fail_before_initialize() {
        if is_initialized() {
            return;
        }
        assert!(matches!(get_sync_service(), Err(ServiceError::Configuration(_))));
        assert!(stop_sync_scheduler().is_ok());
    }
}
