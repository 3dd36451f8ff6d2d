use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domains::outbox::types::{OutboxEntry, OutboxOperation};
use crate::domains::retention::PruneReport;
use crate::errors::DomainResult;

/// Opaque server-issued pull position.
///
/// Stored as text. The remote may send it as a JSON string or a number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "CursorRepr", into = "String")]
pub struct SyncCursor(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum CursorRepr {
    Text(String),
    Number(serde_json::Number),
}

impl From<CursorRepr> for SyncCursor {
    fn from(repr: CursorRepr) -> Self {
        match repr {
            CursorRepr::Text(s) => SyncCursor(s),
            CursorRepr::Number(n) => SyncCursor(n.to_string()),
        }
    }
}

impl From<SyncCursor> for String {
    fn from(cursor: SyncCursor) -> Self {
        cursor.0
    }
}

impl SyncCursor {
    pub fn new(value: impl Into<String>) -> Self {
        SyncCursor(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SyncCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One outbox entry on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushItem {
    pub table: String,
    pub operation: OutboxOperation,
    pub record_id: Uuid,
    pub payload: serde_json::Value,
    pub idempotency_key: Uuid,
}

impl PushItem {
    pub fn from_entry(entry: &OutboxEntry) -> DomainResult<Self> {
        Ok(Self {
            table: entry.table_name.clone(),
            operation: entry.operation,
            record_id: entry.record_id,
            payload: serde_json::from_str(&entry.payload)?,
            idempotency_key: entry.idempotency_key,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub terminal_id: String,
    pub tenant_id: String,
    pub items: Vec<PushItem>,
}

/// Item-level error codes the remote reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushErrorCode {
    Validation,
    /// Idempotency collision: the key was already applied
    Conflict,
    #[serde(alias = "unauthorized")]
    Authentication,
    #[serde(other)]
    Other,
}

impl PushErrorCode {
    /// Whether an entry reported with this code is still counted as processed
    pub fn counts_as_processed(&self) -> bool {
        matches!(self, PushErrorCode::Conflict)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushItemError {
    #[serde(default)]
    pub idempotency_key: Option<Uuid>,
    pub code: PushErrorCode,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    #[serde(default)]
    pub processed_count: u32,
    #[serde(default)]
    pub failed_count: u32,
    #[serde(default)]
    pub errors: Vec<PushItemError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub terminal_id: String,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<SyncCursor>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    #[serde(default)]
    pub entities_by_table: HashMap<String, Vec<serde_json::Value>>,
    #[serde(default)]
    pub new_cursor: Option<SyncCursor>,
    #[serde(default)]
    pub has_more: bool,
}

/// What the sync engine is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Pushing,
    Pulling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Completed,
    /// Another push or pull was already running
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushReport {
    pub status: CycleStatus,
    pub attempted: usize,
    pub marked_synced: u64,
    pub rejected: usize,
    pub dead_lettered: usize,
}

impl PushReport {
    pub fn completed() -> Self {
        Self {
            status: CycleStatus::Completed,
            attempted: 0,
            marked_synced: 0,
            rejected: 0,
            dead_lettered: 0,
        }
    }

    pub fn skipped() -> Self {
        Self { status: CycleStatus::Skipped, ..Self::completed() }
    }
}

/// Decision taken for one remote record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    Inserted,
    Overwritten,
    /// Remote version not newer than the local one
    SkippedStale,
    /// Local row has unsynced edits
    SkippedPendingLocal,
}

/// Tally of one or more applied pages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeSummary {
    pub inserted: usize,
    pub overwritten: usize,
    pub skipped_stale: usize,
    pub skipped_pending: usize,
    pub skipped_unknown_table: usize,
}

impl MergeSummary {
    pub fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::Overwritten => self.overwritten += 1,
            MergeOutcome::SkippedStale => self.skipped_stale += 1,
            MergeOutcome::SkippedPendingLocal => self.skipped_pending += 1,
        }
    }

    pub fn absorb(&mut self, other: &MergeSummary) {
        self.inserted += other.inserted;
        self.overwritten += other.overwritten;
        self.skipped_stale += other.skipped_stale;
        self.skipped_pending += other.skipped_pending;
        self.skipped_unknown_table += other.skipped_unknown_table;
    }

    pub fn applied(&self) -> usize {
        self.inserted + self.overwritten
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullReport {
    pub status: CycleStatus,
    pub pages: u32,
    pub merge: MergeSummary,
    pub cursor: Option<SyncCursor>,
    pub prune: Option<PruneReport>,
}

impl PullReport {
    pub fn completed(cursor: Option<SyncCursor>) -> Self {
        Self {
            status: CycleStatus::Completed,
            pages: 0,
            merge: MergeSummary::default(),
            cursor,
            prune: None,
        }
    }

    pub fn skipped() -> Self {
        Self { status: CycleStatus::Skipped, ..Self::completed(None) }
    }
}

/// Result of `sync()`: a push followed by a pull
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub push: Option<PushReport>,
    /// Non-fatal push failure; the pull still ran
    pub push_error: Option<String>,
    pub pull: PullReport,
}

/// Snapshot for status displays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub pending_count: i64,
    pub dead_lettered_count: i64,
    pub cursor: Option<SyncCursor>,
    pub last_push_at: Option<DateTime<Utc>>,
    pub last_pull_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_accepts_string_or_number() {
        let numeric: PullResponse =
            serde_json::from_str(r#"{"entitiesByTable":{},"newCursor":42,"hasMore":false}"#).unwrap();
        assert_eq!(numeric.new_cursor, Some(SyncCursor::new("42")));

        let text: PullResponse = serde_json::from_str(r#"{"newCursor":"abc","hasMore":true}"#).unwrap();
        assert_eq!(text.new_cursor.unwrap().as_str(), "abc");
        assert!(text.entities_by_table.is_empty());

        let request = PullRequest {
            terminal_id: "t".into(),
            tenant_id: "x".into(),
            cursor: Some(SyncCursor::new("42")),
        };
        assert_eq!(serde_json::to_value(&request).unwrap()["cursor"], serde_json::json!("42"));
    }

    #[test]
    fn unknown_error_codes_fall_back_to_other() {
        let response: PushResponse = serde_json::from_str(
            r#"{"processedCount":1,"failedCount":2,"errors":[
                {"idempotencyKey":null,"code":"rate_limited","message":"slow down"},
                {"code":"conflict","message":"dup"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(response.errors[0].code, PushErrorCode::Other);
        assert!(response.errors[1].code.counts_as_processed());
        assert!(!PushErrorCode::Validation.counts_as_processed());
    }
}
