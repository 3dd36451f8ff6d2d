use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_scalar, Sqlite, SqlitePool, Transaction};

use crate::domains::sync::types::SyncCursor;
use crate::errors::{DbError, DomainError, DomainResult, ValidationError};
use crate::types::{parse_optional_db_timestamp, to_db_timestamp};

const CURSOR_KEY: &str = "pull_cursor";
const LAST_PUSH_KEY: &str = "last_push_at";
const LAST_PULL_KEY: &str = "last_pull_at";
const LAST_ERROR_KEY: &str = "last_error";

pub const RETENTION_DAYS_SETTING: &str = "retention_days";
pub const OUTBOX_RETENTION_DAYS_SETTING: &str = "outbox_retention_days";

pub const DEFAULT_RETENTION_DAYS: i64 = 90;
pub const DEFAULT_OUTBOX_RETENTION_DAYS: i64 = 30;
/// Upper bound for either retention window (about a century)
pub const MAX_RETENTION_DAYS: i64 = 36_500;

/// Persistent sync bookkeeping: the pull cursor, runtime settings and
/// last-run markers
#[async_trait]
pub trait SyncStateRepository: Send + Sync {
    async fn get_cursor(&self) -> DomainResult<Option<SyncCursor>>;

    /// Persist the cursor as part of the page-apply transaction
    async fn set_cursor_with_tx<'t>(
        &self,
        cursor: &SyncCursor,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;

    async fn retention_days(&self) -> DomainResult<i64>;
    async fn set_retention_days(&self, days: i64) -> DomainResult<()>;

    async fn outbox_retention_days(&self) -> DomainResult<i64>;
    async fn set_outbox_retention_days(&self, days: i64) -> DomainResult<()>;

    async fn last_push_at(&self) -> DomainResult<Option<DateTime<Utc>>>;
    async fn set_last_push_at(&self, at: DateTime<Utc>) -> DomainResult<()>;

    async fn last_pull_at(&self) -> DomainResult<Option<DateTime<Utc>>>;
    async fn set_last_pull_at(&self, at: DateTime<Utc>) -> DomainResult<()>;

    async fn last_error(&self) -> DomainResult<Option<String>>;
    /// `None` clears the stored error
    async fn set_last_error(&self, error: Option<&str>) -> DomainResult<()>;
}

pub struct SqliteSyncStateRepository {
    pool: SqlitePool,
}

impl SqliteSyncStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn get_state(&self, key: &str) -> DomainResult<Option<String>> {
        let value = query_scalar::<_, String>("SELECT value FROM sync_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(value)
    }

    async fn put_state(&self, key: &str, value: &str) -> DomainResult<()> {
        upsert_state(key, value)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn clear_state(&self, key: &str) -> DomainResult<()> {
        query("DELETE FROM sync_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn get_setting_days(&self, key: &str, default: i64) -> DomainResult<i64> {
        let raw = query_scalar::<_, String>("SELECT value FROM sync_settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?;

        match raw {
            Some(value) => value.trim().parse::<i64>().map_err(|_| {
                DomainError::Validation(ValidationError::format(key, &format!("not a number: {}", value)))
            }),
            None => Ok(default),
        }
    }

    async fn put_setting_days(&self, key: &str, days: i64) -> DomainResult<()> {
        if !(0..=MAX_RETENTION_DAYS).contains(&days) {
            return Err(DomainError::Validation(ValidationError::range(key, 0, MAX_RETENTION_DAYS)));
        }
        query(
            "INSERT INTO sync_settings (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(days.to_string())
        .bind(to_db_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;

        log::info!("Sync setting {} set to {} days", key, days);
        Ok(())
    }

    async fn get_timestamp(&self, key: &str) -> DomainResult<Option<DateTime<Utc>>> {
        let raw = self.get_state(key).await?;
        parse_optional_db_timestamp(key, &raw)
    }
}

fn upsert_state<'q>(
    key: &'q str,
    value: &'q str,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query(
        "INSERT INTO sync_state (key, value, updated_at) VALUES (?, ?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(to_db_timestamp(&Utc::now()))
}

#[async_trait]
impl SyncStateRepository for SqliteSyncStateRepository {
    async fn get_cursor(&self) -> DomainResult<Option<SyncCursor>> {
        Ok(self.get_state(CURSOR_KEY).await?.map(SyncCursor::new))
    }

    async fn set_cursor_with_tx<'t>(
        &self,
        cursor: &SyncCursor,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        upsert_state(CURSOR_KEY, cursor.as_str())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }

    async fn retention_days(&self) -> DomainResult<i64> {
        self.get_setting_days(RETENTION_DAYS_SETTING, DEFAULT_RETENTION_DAYS).await
    }

    async fn set_retention_days(&self, days: i64) -> DomainResult<()> {
        self.put_setting_days(RETENTION_DAYS_SETTING, days).await
    }

    async fn outbox_retention_days(&self) -> DomainResult<i64> {
        self.get_setting_days(OUTBOX_RETENTION_DAYS_SETTING, DEFAULT_OUTBOX_RETENTION_DAYS).await
    }

    async fn set_outbox_retention_days(&self, days: i64) -> DomainResult<()> {
        self.put_setting_days(OUTBOX_RETENTION_DAYS_SETTING, days).await
    }

    async fn last_push_at(&self) -> DomainResult<Option<DateTime<Utc>>> {
        self.get_timestamp(LAST_PUSH_KEY).await
    }

    async fn set_last_push_at(&self, at: DateTime<Utc>) -> DomainResult<()> {
        self.put_state(LAST_PUSH_KEY, &to_db_timestamp(&at)).await
    }

    async fn last_pull_at(&self) -> DomainResult<Option<DateTime<Utc>>> {
        self.get_timestamp(LAST_PULL_KEY).await
    }

    async fn set_last_pull_at(&self, at: DateTime<Utc>) -> DomainResult<()> {
        self.put_state(LAST_PULL_KEY, &to_db_timestamp(&at)).await
    }

    async fn last_error(&self) -> DomainResult<Option<String>> {
        self.get_state(LAST_ERROR_KEY).await
    }

    async fn set_last_error(&self, error: Option<&str>) -> DomainResult<()> {
        match error {
            Some(message) => self.put_state(LAST_ERROR_KEY, message).await,
            None => self.clear_state(LAST_ERROR_KEY).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::migrated_pool;

    #[tokio::test]
    async fn cursor_is_only_persisted_on_commit() {
        let pool = migrated_pool().await;
        let repo = SqliteSyncStateRepository::new(pool.clone());
        assert_eq!(repo.get_cursor().await.unwrap(), None);

        let mut tx = pool.begin().await.unwrap();
        repo.set_cursor_with_tx(&SyncCursor::new("7"), &mut tx).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(repo.get_cursor().await.unwrap(), None);

        let mut tx = pool.begin().await.unwrap();
        repo.set_cursor_with_tx(&SyncCursor::new("8"), &mut tx).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(repo.get_cursor().await.unwrap(), Some(SyncCursor::new("8")));
    }

    #[tokio::test]
    async fn settings_are_seeded_and_writable() {
        let pool = migrated_pool().await;
        let repo = SqliteSyncStateRepository::new(pool);

        assert_eq!(repo.retention_days().await.unwrap(), DEFAULT_RETENTION_DAYS);
        assert_eq!(repo.outbox_retention_days().await.unwrap(), DEFAULT_OUTBOX_RETENTION_DAYS);

        repo.set_retention_days(14).await.unwrap();
        assert_eq!(repo.retention_days().await.unwrap(), 14);
        assert!(repo.set_outbox_retention_days(-1).await.is_err());

        assert!(repo.set_retention_days(200_000_000).await.is_err());
        repo.set_retention_days(MAX_RETENTION_DAYS).await.unwrap();
        assert_eq!(repo.retention_days().await.unwrap(), MAX_RETENTION_DAYS);
    }

    #[tokio::test]
    async fn last_run_markers() {
        let pool = migrated_pool().await;
        let repo = SqliteSyncStateRepository::new(pool);
        let now = Utc::now();

        repo.set_last_push_at(now).await.unwrap();
        let stored = repo.last_push_at().await.unwrap().unwrap();
        assert_eq!(stored.timestamp_millis(), now.timestamp_millis());
        assert!(repo.last_pull_at().await.unwrap().is_none());

        repo.set_last_error(Some("Transport error: offline")).await.unwrap();
        assert_eq!(repo.last_error().await.unwrap().as_deref(), Some("Transport error: offline"));
        repo.set_last_error(None).await.unwrap();
        assert!(repo.last_error().await.unwrap().is_none());
    }
}
