use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::auth::{AuthContext, IdentityProvider};
use crate::config::CoreConfig;
use crate::domains::outbox::repository::OutboxRepository;
use crate::domains::outbox::types::{FailureOutcome, OutboxEntry};
use crate::domains::retention::RetentionService;
use crate::domains::sync::entity_merger::EntityMerger;
use crate::domains::sync::remote_client::RemoteSyncClient;
use crate::domains::sync::repository::SyncStateRepository;
use crate::domains::sync::types::{
    PullReport, PullRequest, PushErrorCode, PushItem, PushItemError, PushReport, PushRequest,
    PushResponse, SyncPhase, SyncReport, SyncStatus,
};
use crate::errors::{DbError, SyncError, SyncResult};

/// Tunables of the sync engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub push_batch_size: u32,
    pub max_pull_pages: u32,
    pub max_push_attempts: Option<u32>,
    pub protect_pending_local_edits: bool,
}

impl From<&CoreConfig> for SyncOptions {
    fn from(config: &CoreConfig) -> Self {
        Self {
            push_batch_size: config.push_batch_size,
            max_pull_pages: config.max_pull_pages,
            max_push_attempts: config.max_push_attempts,
            protect_pending_local_edits: config.protect_pending_local_edits,
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&CoreConfig::default())
    }
}

/// High-level trait for the synchronisation service.
#[async_trait]
pub trait SyncService: Send + Sync {
    /// Drain one batch of the outbox to the remote.
    async fn push(&self) -> SyncResult<PushReport>;

    /// Fetch and apply remote pages until the remote reports no more, then
    /// run retention.
    async fn pull(&self) -> SyncResult<PullReport>;

    /// Push, then pull. Only a fatal push error prevents the pull.
    async fn sync(&self) -> SyncResult<SyncReport>;

    async fn status(&self) -> SyncResult<SyncStatus>;

    fn phase(&self) -> SyncPhase;
}

/// Resets the shared phase to `Idle` when the running push or pull ends,
/// including on early return or panic.
struct PhaseGuard {
    phase: Arc<Mutex<SyncPhase>>,
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        *lock_phase(&self.phase) = SyncPhase::Idle;
    }
}

fn lock_phase(phase: &Mutex<SyncPhase>) -> MutexGuard<'_, SyncPhase> {
    phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy)]
enum RunKind {
    Push,
    Pull,
}

/// Implementation of the synchronisation service.
pub struct SyncServiceImpl {
    pool: SqlitePool,
    outbox_repo: Arc<dyn OutboxRepository>,
    state_repo: Arc<dyn SyncStateRepository>,
    entity_merger: Arc<EntityMerger>,
    remote: Arc<dyn RemoteSyncClient>,
    identity: Arc<dyn IdentityProvider>,
    retention: Arc<RetentionService>,
    options: SyncOptions,
    phase: Arc<Mutex<SyncPhase>>,
}

impl SyncServiceImpl {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        outbox_repo: Arc<dyn OutboxRepository>,
        state_repo: Arc<dyn SyncStateRepository>,
        entity_merger: Arc<EntityMerger>,
        remote: Arc<dyn RemoteSyncClient>,
        identity: Arc<dyn IdentityProvider>,
        retention: Arc<RetentionService>,
        options: SyncOptions,
    ) -> Self {
        Self {
            pool,
            outbox_repo,
            state_repo,
            entity_merger,
            remote,
            identity,
            retention,
            options,
            phase: Arc::new(Mutex::new(SyncPhase::Idle)),
        }
    }

    /// Atomically move from `Idle` to `next`. `None` if something is running.
    fn try_begin(&self, next: SyncPhase) -> Option<PhaseGuard> {
        let mut phase = lock_phase(&self.phase);
        if *phase != SyncPhase::Idle {
            log::info!("Sync {:?} skipped: {:?} already in progress", next, *phase);
            return None;
        }
        *phase = next;
        Some(PhaseGuard { phase: Arc::clone(&self.phase) })
    }

    fn require_auth(&self) -> SyncResult<AuthContext> {
        match self.identity.current() {
            Some(auth) if !auth.api_token.is_empty() => Ok(auth),
            Some(_) => Err(SyncError::AuthenticationFailed("No API token available".to_string())),
            None => Err(SyncError::AuthenticationFailed("Terminal is not signed in".to_string())),
        }
    }

    /// Persist last-run bookkeeping. Failures here are logged, never returned.
    async fn record_run<T>(&self, kind: RunKind, result: &SyncResult<T>) {
        let bookkeeping = match result {
            Ok(_) => {
                let stamp = match kind {
                    RunKind::Push => self.state_repo.set_last_push_at(Utc::now()).await,
                    RunKind::Pull => self.state_repo.set_last_pull_at(Utc::now()).await,
                };
                match stamp {
                    Ok(()) => self.state_repo.set_last_error(None).await,
                    Err(e) => Err(e),
                }
            }
            Err(e) => {
                if e.is_fatal() {
                    log::error!("Sync {:?} aborted: {}", kind, e);
                } else {
                    log::warn!("Sync {:?} failed, will retry next cycle: {}", kind, e);
                }
                self.state_repo.set_last_error(Some(&e.to_string())).await
            }
        };
        if let Err(e) = bookkeeping {
            log::warn!("Failed to record sync {:?} state: {}", kind, e);
        }
    }

    async fn push_batch(&self) -> SyncResult<PushReport> {
        let auth = self.require_auth()?;
        let entries = self.outbox_repo.list_unsynced(self.options.push_batch_size).await?;
        if entries.is_empty() {
            log::debug!("Outbox empty, nothing to push");
            return Ok(PushReport::completed());
        }

        let request = PushRequest {
            terminal_id: auth.terminal_id.clone(),
            tenant_id: auth.tenant_id.clone(),
            items: entries.iter().map(PushItem::from_entry).collect::<Result<Vec<_>, _>>()?,
        };

        // Any failure before a response leaves every entry unsynced
        let response = self.remote.push(&auth.api_token, &request).await?;
        self.apply_push_response(&entries, &response).await
    }

    /// Mark and count entries from the remote's verdict.
    ///
    /// In FIFO order, entries reported with a non-conflict error are set
    /// aside and the first `processed_count` of the rest are marked synced.
    async fn apply_push_response(
        &self,
        entries: &[OutboxEntry],
        response: &PushResponse,
    ) -> SyncResult<PushReport> {
        let rejected: HashMap<Uuid, &PushItemError> = response
            .errors
            .iter()
            .filter(|err| !err.code.counts_as_processed())
            .filter_map(|err| err.idempotency_key.map(|key| (key, err)))
            .collect();

        let unkeyed = response.errors.iter().filter(|err| err.idempotency_key.is_none()).count();
        if unkeyed > 0 {
            log::warn!("Remote reported {} errors without an idempotency key", unkeyed);
        }

        let counted: Vec<i64> = entries
            .iter()
            .filter(|entry| !rejected.contains_key(&entry.idempotency_key))
            .take(response.processed_count as usize)
            .map(|entry| entry.sequence_id)
            .collect();

        let mut report = PushReport::completed();
        report.attempted = entries.len();
        report.marked_synced = self.outbox_repo.mark_synced_batch(&counted).await?;

        let mut auth_error: Option<String> = None;
        for entry in entries {
            let Some(err) = rejected.get(&entry.idempotency_key) else {
                continue;
            };
            if err.code == PushErrorCode::Authentication {
                auth_error.get_or_insert_with(|| err.message.clone());
                continue;
            }
            report.rejected += 1;
            let outcome = self
                .outbox_repo
                .record_failure(entry.sequence_id, &err.message, self.options.max_push_attempts)
                .await?;
            match outcome {
                FailureOutcome::DeadLettered { .. } => report.dead_lettered += 1,
                FailureOutcome::WillRetry { attempts } => log::debug!(
                    "Outbox entry {} rejected ({:?}), attempt {}: {}",
                    entry.sequence_id, err.code, attempts, err.message
                ),
                FailureOutcome::NotPending => {}
            }
        }

        log::info!(
            "Push: {} attempted, {} synced, {} rejected, {} dead-lettered",
            report.attempted, report.marked_synced, report.rejected, report.dead_lettered
        );

        if let Some(message) = auth_error {
            return Err(SyncError::AuthenticationFailed(message));
        }
        Ok(report)
    }

    async fn pull_pages(&self) -> SyncResult<PullReport> {
        let auth = self.require_auth()?;
        let mut cursor = self.state_repo.get_cursor().await?;
        let mut report = PullReport::completed(cursor.clone());

        loop {
            if report.pages >= self.options.max_pull_pages {
                log::warn!("Pull stopped after {} pages; remaining changes wait for the next cycle", report.pages);
                break;
            }

            let request = PullRequest {
                terminal_id: auth.terminal_id.clone(),
                tenant_id: auth.tenant_id.clone(),
                cursor: cursor.clone(),
            };
            let page = self.remote.pull(&auth.api_token, &request).await?;
            if page.has_more && page.new_cursor.as_ref().map_or(true, |next| Some(next) == cursor.as_ref()) {
                return Err(SyncError::InvalidResponse(format!(
                    "Pull page reports more changes but the cursor did not advance from {:?}",
                    cursor
                )));
            }

            // Entities and cursor commit together or not at all
            let mut tx = self.pool.begin().await.map_err(DbError::from)?;
            let applied = async {
                let summary = self
                    .entity_merger
                    .apply_page_with_tx(&page.entities_by_table, self.options.protect_pending_local_edits, &mut tx)
                    .await?;
                if let Some(next) = &page.new_cursor {
                    self.state_repo.set_cursor_with_tx(next, &mut tx).await?;
                }
                Ok::<_, SyncError>(summary)
            }
            .await;

            let summary = match applied {
                Ok(summary) => {
                    tx.commit().await.map_err(DbError::from)?;
                    summary
                }
                Err(e) => {
                    let _ = tx.rollback().await;
                    return Err(e);
                }
            };

            report.pages += 1;
            report.merge.absorb(&summary);
            if page.new_cursor.is_some() {
                cursor = page.new_cursor;
            }
            log::debug!("Pull page {} applied, cursor now {:?}", report.pages, cursor);

            if !page.has_more {
                break;
            }
        }

        report.cursor = cursor;
        log::info!(
            "Pull: {} pages, {} inserted, {} overwritten, {} stale, {} kept for pending edits",
            report.pages,
            report.merge.inserted,
            report.merge.overwritten,
            report.merge.skipped_stale,
            report.merge.skipped_pending
        );

        match self.retention.prune(Utc::now()).await {
            Ok(prune) => report.prune = Some(prune),
            Err(e) => log::error!("Retention after pull failed: {}", e),
        }
        Ok(report)
    }
}

#[async_trait]
impl SyncService for SyncServiceImpl {
    async fn push(&self) -> SyncResult<PushReport> {
        let Some(_guard) = self.try_begin(SyncPhase::Pushing) else {
            return Ok(PushReport::skipped());
        };
        let result = self.push_batch().await;
        self.record_run(RunKind::Push, &result).await;
        result
    }

    async fn pull(&self) -> SyncResult<PullReport> {
        let Some(_guard) = self.try_begin(SyncPhase::Pulling) else {
            return Ok(PullReport::skipped());
        };
        let result = self.pull_pages().await;
        self.record_run(RunKind::Pull, &result).await;
        result
    }

    async fn sync(&self) -> SyncResult<SyncReport> {
        let (push, push_error) = match self.push().await {
            Ok(report) => (Some(report), None),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => (None, Some(e.to_string())),
        };
        let pull = self.pull().await?;
        Ok(SyncReport { push, push_error, pull })
    }

    async fn status(&self) -> SyncResult<SyncStatus> {
        Ok(SyncStatus {
            phase: self.phase(),
            pending_count: self.outbox_repo.count_unsynced().await?,
            dead_lettered_count: self.outbox_repo.count_dead_lettered().await?,
            cursor: self.state_repo.get_cursor().await?,
            last_push_at: self.state_repo.last_push_at().await?,
            last_pull_at: self.state_repo.last_pull_at().await?,
            last_error: self.state_repo.last_error().await?,
        })
    }

    fn phase(&self) -> SyncPhase {
        *lock_phase(&self.phase)
    }
}
