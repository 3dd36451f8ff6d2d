use chrono::Utc;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::errors::{DbError, DbResult};
use crate::types::to_db_timestamp;

// Embed all migration SQL files at compile time
const MIGRATION_ENTITIES: &str = include_str!("../migrations/20250101000000_entities.sql");
const MIGRATION_OUTBOX: &str = include_str!("../migrations/20250101000100_outbox.sql");
const MIGRATION_SYNC_STATE: &str = include_str!("../migrations/20250101000200_sync_state.sql");
const MIGRATION_DEAD_LETTER_INDEX: &str = include_str!("../migrations/20250301000000_outbox_dead_letter_index.sql");

/// A single schema step. Steps are additive only.
#[derive(Debug, Clone, Copy)]
pub enum MigrationStep {
    /// Script made of `IF NOT EXISTS` / `OR IGNORE` statements
    Sql(&'static str),
    /// New optional column, added only if the table does not have it yet
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub step: MigrationStep,
}

/// Ordered list of migrations; versions must be strictly increasing.
pub const MIGRATIONS: &[Migration] = &[
    Migration { version: 1, name: "entities", step: MigrationStep::Sql(MIGRATION_ENTITIES) },
    Migration { version: 2, name: "outbox", step: MigrationStep::Sql(MIGRATION_OUTBOX) },
    Migration { version: 3, name: "sync_state", step: MigrationStep::Sql(MIGRATION_SYNC_STATE) },
    Migration {
        version: 4,
        name: "products_barcode",
        step: MigrationStep::AddColumn { table: "products", column: "barcode", definition: "TEXT" },
    },
    Migration {
        version: 5,
        name: "customers_notes",
        step: MigrationStep::AddColumn { table: "customers", column: "notes", definition: "TEXT" },
    },
    Migration {
        version: 6,
        name: "outbox_attempts",
        step: MigrationStep::AddColumn { table: "sync_outbox", column: "attempts", definition: "INTEGER NOT NULL DEFAULT 0" },
    },
    Migration {
        version: 7,
        name: "outbox_last_error",
        step: MigrationStep::AddColumn { table: "sync_outbox", column: "last_error", definition: "TEXT" },
    },
    Migration {
        version: 8,
        name: "outbox_dead_lettered",
        step: MigrationStep::AddColumn { table: "sync_outbox", column: "dead_lettered", definition: "INTEGER NOT NULL DEFAULT 0" },
    },
    Migration { version: 9, name: "outbox_dead_letter_index", step: MigrationStep::Sql(MIGRATION_DEAD_LETTER_INDEX) },
];

/// Bring the schema up to date. Safe to call on every startup.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    log::info!("[DB_MIGRATION] Starting database migration process");

    create_migrations_table(pool).await?;
    let current = get_schema_version(pool).await?;
    log::debug!("[DB_MIGRATION] Current schema version: {}", current);

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if pending.is_empty() {
        log::info!("[DB_MIGRATION] No pending migrations to apply");
        return Ok(());
    }

    for migration in pending {
        log::info!("[DB_MIGRATION] Applying migration {} ({})", migration.version, migration.name);

        let mut tx = pool.begin().await?;
        if let Err(e) = apply_step(&mut tx, migration.step).await {
            let _ = tx.rollback().await;
            log::error!("[DB_MIGRATION] Failed to apply migration {}: {}", migration.name, e);
            return Err(DbError::Migration(format!("{}: {}", migration.name, e)));
        }

        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(migration.version)
            .bind(migration.name)
            .bind(to_db_timestamp(&Utc::now()))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
    }

    log::info!("[DB_MIGRATION] Database migration process completed successfully");
    Ok(())
}

/// Highest applied migration version, 0 for a fresh database
pub async fn get_schema_version(pool: &SqlitePool) -> DbResult<i64> {
    let version = sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(version) FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}

async fn create_migrations_table(pool: &SqlitePool) -> DbResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY NOT NULL,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )"
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn apply_step(tx: &mut Transaction<'_, Sqlite>, step: MigrationStep) -> DbResult<()> {
    match step {
        MigrationStep::Sql(sql) => {
            sqlx::raw_sql(sql).execute(&mut **tx).await?;
        }
        MigrationStep::AddColumn { table, column, definition } => {
            if column_exists(tx, table, column).await? {
                log::debug!("[DB_MIGRATION] Column {}.{} already present, skipping", table, column);
            } else {
                let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, definition);
                sqlx::query(&sql).execute(&mut **tx).await?;
            }
        }
    }
    Ok(())
}

async fn column_exists(tx: &mut Transaction<'_, Sqlite>, table: &str, column: &str) -> DbResult<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
        .bind(table)
        .bind(column)
        .fetch_one(&mut **tx)
        .await?;
    Ok(count > 0)
}
