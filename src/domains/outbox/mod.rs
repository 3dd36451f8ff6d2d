pub mod repository;
pub mod types;

pub use repository::{OutboxRepository, SqliteOutboxRepository};
pub use types::{Change, FailureOutcome, OutboxEntry, OutboxOperation};
