use serde::{Deserialize, Serialize};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::errors::{DomainError, DomainResult, ValidationError};

/// Pagination parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaginationParams {
    pub page: u32,
    pub per_page: u32,
}

impl Default for PaginationParams {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
        }
    }
}

impl PaginationParams {
    pub fn new(page: u32, per_page: u32) -> Self {
        Self {
            page: page.max(1),
            per_page: per_page.clamp(1, 500),
        }
    }

    pub fn offset(&self) -> i64 {
        (self.page.max(1) as i64 - 1) * self.limit()
    }

    pub fn limit(&self) -> i64 {
        self.per_page.max(1) as i64
    }
}

/// Paginated result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub total_pages: u32,
}

impl<T> PaginatedResult<T> {
    pub fn new(items: Vec<T>, total: u64, params: PaginationParams) -> Self {
        let per_page = params.per_page.max(1);
        let total_pages = total.div_ceil(per_page as u64) as u32;
        Self {
            items,
            total,
            page: params.page,
            per_page,
            total_pages,
        }
    }
}

/// Timestamps are stored as fixed-width RFC3339 text so that SQL string
/// comparison matches chronological order.
pub fn to_db_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_db_timestamp(field: &str, value: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DomainError::Validation(ValidationError::format(
            field,
            &format!("Invalid RFC3339 format: {}", value),
        )))
}

pub fn parse_optional_db_timestamp(field: &str, value: &Option<String>) -> DomainResult<Option<DateTime<Utc>>> {
    match value {
        Some(v) => parse_db_timestamp(field, v).map(Some),
        None => Ok(None),
    }
}
