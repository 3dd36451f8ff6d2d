use std::sync::Arc;

// Public modules
pub mod auth;
pub mod config;
pub mod domains;
pub mod errors;
pub mod globals;
pub mod runtime;
pub mod types;
pub mod validation;

// Private modules
mod db_migration;

#[cfg(test)]
mod test_support;

pub use config::CoreConfig;
pub use runtime::PosCore;

use auth::IdentityProvider;
use errors::ServiceResult;

/// Initialize the library: logging, the terminal database and every service.
/// This function must be called before any getter in [`globals`].
pub async fn initialize(config: CoreConfig, identity: Arc<dyn IdentityProvider>) -> ServiceResult<()> {
    if std::env::var("RUST_LOG").is_err() {
        #[cfg(debug_assertions)]
        std::env::set_var("RUST_LOG", "debug");
        #[cfg(not(debug_assertions))]
        std::env::set_var("RUST_LOG", "info");
    }
    // Embedders may have installed their own logger already
    let _ = env_logger::try_init();

    log::debug!("Database URL: {}", config.database_url);
    globals::initialize(config, identity).await
}

/// Same as [`initialize`], with configuration read from `POS_*` variables and `.env`
pub async fn initialize_from_env(identity: Arc<dyn IdentityProvider>) -> ServiceResult<()> {
    initialize(CoreConfig::from_env()?, identity).await
}

/// Get a reference to the SQLite connection pool
pub fn get_db_pool() -> ServiceResult<sqlx::SqlitePool> {
    globals::get_db_pool()
}
