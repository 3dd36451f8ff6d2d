//! Shared fixtures for the in-crate test modules.

use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::auth::{AuthContext, StaticIdentityProvider};
use crate::db_migration::run_migrations;

/// Single-connection in-memory database. The connection must never be
/// recycled or the database disappears with it.
pub async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite")
}

pub async fn migrated_pool() -> SqlitePool {
    let pool = memory_pool().await;
    run_migrations(&pool).await.expect("migrations");
    pool
}

pub fn test_auth() -> AuthContext {
    AuthContext::new(Uuid::new_v4(), "terminal-01", "tenant-01", "test-token")
}

pub fn signed_in_identity() -> Arc<StaticIdentityProvider> {
    Arc::new(StaticIdentityProvider::new(Some(test_auth())))
}
