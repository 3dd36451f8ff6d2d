use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::domains::customer::types::Customer;
use crate::domains::product::types::Product;
use crate::domains::sale::types::Sale;
use crate::errors::{DomainError, DomainResult, ValidationError};
use crate::types::{parse_db_timestamp, parse_optional_db_timestamp};

/// Kind of local mutation an outbox entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxOperation {
    Insert,
    Update,
    Delete,
}

impl OutboxOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxOperation::Insert => "INSERT",
            OutboxOperation::Update => "UPDATE",
            OutboxOperation::Delete => "DELETE",
        }
    }
}

impl FromStr for OutboxOperation {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(OutboxOperation::Insert),
            "UPDATE" => Ok(OutboxOperation::Update),
            "DELETE" => Ok(OutboxOperation::Delete),
            _ => Err(DomainError::Validation(ValidationError::custom(
                &format!("Invalid OutboxOperation string: {}", s)
            ))),
        }
    }
}

impl fmt::Display for OutboxOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The record state captured by a mutation, one variant per synced table.
///
/// On the wire and in the outbox the payload is the bare record JSON; the
/// table name travels alongside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "record")]
pub enum Change {
    #[serde(rename = "products")]
    Product(Product),
    #[serde(rename = "customers")]
    Customer(Customer),
    #[serde(rename = "sales")]
    Sale(Sale),
}

impl Change {
    pub const TABLES: [&'static str; 3] = ["products", "customers", "sales"];

    pub fn table_name(&self) -> &'static str {
        match self {
            Change::Product(_) => "products",
            Change::Customer(_) => "customers",
            Change::Sale(_) => "sales",
        }
    }

    pub fn record_id(&self) -> Uuid {
        match self {
            Change::Product(p) => p.id,
            Change::Customer(c) => c.id,
            Change::Sale(s) => s.id,
        }
    }

    pub fn version(&self) -> i64 {
        match self {
            Change::Product(p) => p.version,
            Change::Customer(c) => c.version,
            Change::Sale(s) => s.version,
        }
    }

    pub fn is_deleted(&self) -> bool {
        match self {
            Change::Product(p) => p.deleted_at.is_some(),
            Change::Customer(c) => c.deleted_at.is_some(),
            Change::Sale(s) => s.deleted_at.is_some(),
        }
    }

    /// Bare record JSON, as stored in `sync_outbox.payload`
    pub fn to_payload(&self) -> DomainResult<String> {
        let json = match self {
            Change::Product(p) => serde_json::to_string(p)?,
            Change::Customer(c) => serde_json::to_string(c)?,
            Change::Sale(s) => serde_json::to_string(s)?,
        };
        Ok(json)
    }

    /// Decode a bare record for `table`. Unknown tables are a validation error.
    pub fn from_value(table: &str, value: serde_json::Value) -> DomainResult<Self> {
        let change = match table {
            "products" => Change::Product(serde_json::from_value(value)?),
            "customers" => Change::Customer(serde_json::from_value(value)?),
            "sales" => Change::Sale(serde_json::from_value(value)?),
            other => {
                return Err(DomainError::Validation(ValidationError::entity(
                    &format!("Unknown sync table: {}", other)
                )))
            }
        };
        Ok(change)
    }

    pub fn from_payload(table: &str, payload: &str) -> DomainResult<Self> {
        let value: serde_json::Value = serde_json::from_str(payload)?;
        Self::from_value(table, value)
    }
}

/// A durable record of one local mutation awaiting delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub sequence_id: i64,
    pub table_name: String,
    pub operation: OutboxOperation,
    pub record_id: Uuid,
    pub payload: String,
    /// Generated once per mutation, reused on every retry
    pub idempotency_key: Uuid,
    pub created_at: DateTime<Utc>,
    pub synced: bool,
    pub synced_at: Option<DateTime<Utc>>,
    /// Pushes in which the remote rejected this entry
    pub attempts: i64,
    pub last_error: Option<String>,
    pub dead_lettered: bool,
}

impl OutboxEntry {
    /// Typed view of the payload
    pub fn change(&self) -> DomainResult<Change> {
        Change::from_payload(&self.table_name, &self.payload)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct OutboxEntryRow {
    pub sequence_id: i64,
    pub table_name: String,
    pub operation: String,
    pub record_id: String,
    pub payload: String,
    pub idempotency_key: String,
    pub created_at: String,
    pub synced: i64,
    pub synced_at: Option<String>,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub dead_lettered: i64,
}

impl OutboxEntryRow {
    pub fn into_entity(self) -> DomainResult<OutboxEntry> {
        let record_id = Uuid::parse_str(&self.record_id)
            .map_err(|_| DomainError::InvalidUuid(self.record_id.clone()))?;
        let idempotency_key = Uuid::parse_str(&self.idempotency_key)
            .map_err(|_| DomainError::InvalidUuid(self.idempotency_key.clone()))?;

        Ok(OutboxEntry {
            sequence_id: self.sequence_id,
            operation: self.operation.parse()?,
            created_at: parse_db_timestamp("created_at", &self.created_at)?,
            synced_at: parse_optional_db_timestamp("synced_at", &self.synced_at)?,
            table_name: self.table_name,
            record_id,
            payload: self.payload,
            idempotency_key,
            synced: self.synced != 0,
            attempts: self.attempts,
            last_error: self.last_error,
            dead_lettered: self.dead_lettered != 0,
        })
    }
}

/// Result of recording a remote rejection against an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Entry stays queued and will be retried
    WillRetry { attempts: i64 },
    /// Entry reached the attempt limit and is parked
    DeadLettered { attempts: i64 },
    /// Entry no longer pending (already synced or removed)
    NotPending,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_round_trips_through_text() {
        for op in [OutboxOperation::Insert, OutboxOperation::Update, OutboxOperation::Delete] {
            assert_eq!(op.as_str().parse::<OutboxOperation>().unwrap(), op);
        }
        assert!("UPSERT".parse::<OutboxOperation>().is_err());
        assert_eq!(serde_json::to_string(&OutboxOperation::Delete).unwrap(), "\"DELETE\"");
    }

    #[test]
    fn unknown_table_is_rejected() {
        let err = Change::from_value("invoices", serde_json::json!({})).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}
