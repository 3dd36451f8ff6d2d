use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domains::sync::types::{PullRequest, PullResponse, PushRequest, PushResponse};
use crate::errors::{SyncError, SyncResult};

/// Trait for the remote sync endpoints
#[async_trait]
pub trait RemoteSyncClient: Send + Sync {
    /// Submit one batch of outbox entries
    async fn push(&self, api_token: &str, request: &PushRequest) -> SyncResult<PushResponse>;

    /// Fetch one page of remote changes after `request.cursor`
    async fn pull(&self, api_token: &str, request: &PullRequest) -> SyncResult<PullResponse>;
}

/// RemoteSyncClient over HTTPS with a bearer token
pub struct HttpSyncClient {
    client: Client,
    base_url: String,
}

impl HttpSyncClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SyncError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn auth_header(&self, api_token: &str) -> String {
        format!("Bearer {}", api_token)
    }

    async fn post_json<B, R>(&self, path: &str, api_token: &str, body: &B) -> SyncResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header(api_token))
            .json(body)
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("Request to {} failed: {}", path, e)))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<R>()
                .await
                .map_err(|e| SyncError::InvalidResponse(format!("Failed to parse {} response: {}", path, e)));
        }

        let error_text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unable to get error details".to_string());

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                SyncError::AuthenticationFailed(format!("Server returned {}: {}", status, error_text))
            }
            StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => {
                SyncError::Validation(format!("Server returned {}: {}", status, error_text))
            }
            _ => SyncError::Server(format!("Server returned error {}: {}", status, error_text)),
        })
    }
}

#[async_trait]
impl RemoteSyncClient for HttpSyncClient {
    async fn push(&self, api_token: &str, request: &PushRequest) -> SyncResult<PushResponse> {
        debug!("Pushing {} outbox entries for terminal {}", request.items.len(), request.terminal_id);
        self.post_json("/api/sync/push", api_token, request).await
    }

    async fn pull(&self, api_token: &str, request: &PullRequest) -> SyncResult<PullResponse> {
        debug!("Pulling changes since cursor {:?}", request.cursor);
        self.post_json("/api/sync/pull", api_token, request).await
    }
}

#[cfg(test)]
pub use mock::MockRemote;

/// In-memory remote for tests: applies pushes idempotently by key, supports
/// scripted rejections, failures and pull pages
#[cfg(test)]
mod mock {
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::Mutex;

    use uuid::Uuid;

    use super::*;
    use crate::domains::sync::types::{PushErrorCode, PushItem, PushItemError, SyncCursor};

    #[derive(Default)]
    struct MockState {
        applied_keys: HashSet<Uuid>,
        records: HashMap<(String, Uuid), serde_json::Value>,
        rejections: HashMap<Uuid, (PushErrorCode, String)>,
        processed_cap: Option<u32>,
        push_failures: VecDeque<SyncError>,
        pages: VecDeque<SyncResult<PullResponse>>,
        push_calls: usize,
        pull_cursors: Vec<Option<SyncCursor>>,
    }

    #[derive(Default)]
    pub struct MockRemote {
        state: Mutex<MockState>,
    }

    impl MockRemote {
        pub fn new() -> Self {
            Self::default()
        }

        fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.state.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Reject every push item for `record_id` with the given code
        pub fn reject_record(&self, record_id: Uuid, code: PushErrorCode, message: &str) {
            self.state().rejections.insert(record_id, (code, message.to_string()));
        }

        pub fn accept_record(&self, record_id: Uuid) {
            self.state().rejections.remove(&record_id);
        }

        /// Report at most `cap` items processed (simulates a partial batch)
        pub fn cap_processed(&self, cap: Option<u32>) {
            self.state().processed_cap = cap;
        }

        pub fn fail_next_push(&self, error: SyncError) {
            self.state().push_failures.push_back(error);
        }

        /// Queue a pull failure behind any pages already queued
        pub fn fail_next_pull(&self, error: SyncError) {
            self.state().pages.push_back(Err(error));
        }

        pub fn enqueue_page(&self, page: PullResponse) {
            self.state().pages.push_back(Ok(page));
        }

        pub fn record(&self, table: &str, id: Uuid) -> Option<serde_json::Value> {
            self.state().records.get(&(table.to_string(), id)).cloned()
        }

        pub fn applied_count(&self) -> usize {
            self.state().applied_keys.len()
        }

        pub fn push_calls(&self) -> usize {
            self.state().push_calls
        }

        pub fn pull_cursors(&self) -> Vec<Option<SyncCursor>> {
            self.state().pull_cursors.clone()
        }

        fn apply(state: &mut MockState, item: &PushItem) {
            state.applied_keys.insert(item.idempotency_key);
            state.records.insert((item.table.clone(), item.record_id), item.payload.clone());
        }
    }

    #[async_trait]
    impl RemoteSyncClient for MockRemote {
        async fn push(&self, _api_token: &str, request: &PushRequest) -> SyncResult<PushResponse> {
            let mut state = self.state();
            state.push_calls += 1;
            if let Some(error) = state.push_failures.pop_front() {
                return Err(error);
            }

            let mut response = PushResponse::default();
            for item in &request.items {
                if state.processed_cap.is_some_and(|cap| response.processed_count >= cap) {
                    break;
                }
                if state.applied_keys.contains(&item.idempotency_key) {
                    // Already applied: counted, state untouched
                    response.processed_count += 1;
                    continue;
                }
                if let Some((code, message)) = state.rejections.get(&item.record_id).cloned() {
                    // A conflict means the remote already holds this change
                    if code.counts_as_processed() {
                        response.processed_count += 1;
                    } else {
                        response.failed_count += 1;
                    }
                    response.errors.push(PushItemError {
                        idempotency_key: Some(item.idempotency_key),
                        code,
                        message,
                    });
                    continue;
                }
                Self::apply(&mut state, item);
                response.processed_count += 1;
            }
            Ok(response)
        }

        async fn pull(&self, _api_token: &str, request: &PullRequest) -> SyncResult<PullResponse> {
            let mut state = self.state();
            state.pull_cursors.push(request.cursor.clone());
            state.pages.pop_front().unwrap_or_else(|| Ok(PullResponse::default()))
        }
    }
}
