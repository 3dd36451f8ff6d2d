use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::domains::core::repository::Versioned;
use crate::errors::{DomainError, DomainResult, ValidationError};
use crate::types::{parse_db_timestamp, parse_optional_db_timestamp};
use crate::validation::{Validate, ValidationBuilder};

/// How a sale was paid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Mobile,
    Other,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Mobile => "mobile",
            PaymentMethod::Other => "other",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cash" => Ok(PaymentMethod::Cash),
            "card" => Ok(PaymentMethod::Card),
            "mobile" => Ok(PaymentMethod::Mobile),
            "other" => Ok(PaymentMethod::Other),
            _ => Err(DomainError::Validation(ValidationError::invalid_value(
                "payment_method",
                &format!("unknown payment method '{}'", s),
            ))),
        }
    }
}

/// Lifecycle of a sale. Only `Open` sales can be edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaleStatus {
    Open,
    Completed,
    Voided,
}

impl SaleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaleStatus::Open => "open",
            SaleStatus::Completed => "completed",
            SaleStatus::Voided => "voided",
        }
    }

    /// Completed and voided sales are eligible for retention
    pub fn is_closed(&self) -> bool {
        !matches!(self, SaleStatus::Open)
    }
}

impl FromStr for SaleStatus {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(SaleStatus::Open),
            "completed" => Ok(SaleStatus::Completed),
            "voided" => Ok(SaleStatus::Voided),
            _ => Err(DomainError::Validation(ValidationError::invalid_value(
                "status",
                &format!("unknown sale status '{}'", s),
            ))),
        }
    }
}

impl fmt::Display for SaleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleLine {
    pub product_id: Option<Uuid>,
    pub description: String,
    pub quantity: i64,
    pub unit_price: Decimal,
}

/// A transaction rung up at the terminal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sale {
    pub id: Uuid,
    pub receipt_number: String,
    pub customer_id: Option<Uuid>,
    #[serde(default)]
    pub lines: Vec<SaleLine>,
    /// Supplied by the caller; pricing happens outside this crate
    pub total: Decimal,
    pub payment_method: PaymentMethod,
    pub status: SaleStatus,
    /// When the sale was closed (completed or voided)
    pub completed_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Versioned for Sale {
    fn record_id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }
}

impl Sale {
    pub fn apply_update(&mut self, update: &UpdateSale) -> bool {
        let before = self.clone();
        if let Some(customer_id) = update.customer_id {
            self.customer_id = Some(customer_id);
        }
        if let Some(lines) = &update.lines {
            self.lines = lines.clone();
        }
        if let Some(total) = update.total {
            self.total = total;
        }
        if let Some(method) = update.payment_method {
            self.payment_method = method;
        }
        *self != before
    }

    pub fn ensure_open(&self) -> DomainResult<()> {
        if self.status != SaleStatus::Open {
            return Err(DomainError::Validation(ValidationError::invalid_value(
                "status",
                &format!("sale is already {}", self.status),
            )));
        }
        Ok(())
    }
}

fn validate_money(field: &str, amount: Decimal) -> DomainResult<()> {
    ValidationBuilder::new(field, Some(amount))
        .min(Decimal::ZERO)
        .validate_with(|value| {
            if value.scale() > 4 {
                Err(ValidationError::format(field, "at most 4 decimal places"))
            } else {
                Ok(())
            }
        })
        .validate()
}

fn validate_lines(lines: &[SaleLine]) -> DomainResult<()> {
    for line in lines {
        ValidationBuilder::new("description", Some(line.description.clone()))
            .not_blank()
            .max_length(200)
            .validate()?;
        ValidationBuilder::new("quantity", Some(line.quantity)).min(1).validate()?;
        validate_money("unit_price", line.unit_price)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSale {
    pub receipt_number: String,
    pub customer_id: Option<Uuid>,
    pub lines: Vec<SaleLine>,
    pub total: Decimal,
    pub payment_method: PaymentMethod,
}

impl Validate for NewSale {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("receipt_number", Some(self.receipt_number.clone()))
            .required()
            .not_blank()
            .max_length(64)
            .validate()?;
        validate_money("total", self.total)?;
        validate_lines(&self.lines)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateSale {
    pub customer_id: Option<Uuid>,
    pub lines: Option<Vec<SaleLine>>,
    pub total: Option<Decimal>,
    pub payment_method: Option<PaymentMethod>,
}

impl Validate for UpdateSale {
    fn validate(&self) -> DomainResult<()> {
        if let Some(total) = self.total {
            validate_money("total", total)?;
        }
        match &self.lines {
            Some(lines) => validate_lines(lines),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaleFilter {
    pub status: Option<SaleStatus>,
    pub customer_id: Option<Uuid>,
    /// Inclusive lower bound on `created_at`
    pub created_from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`
    pub created_to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SaleRow {
    pub id: String,
    pub receipt_number: String,
    pub customer_id: Option<String>,
    pub lines: String,
    pub total: String,
    pub payment_method: String,
    pub status: String,
    pub completed_at: Option<String>,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl SaleRow {
    pub fn into_entity(self) -> DomainResult<Sale> {
        let id = Uuid::parse_str(&self.id).map_err(|_| DomainError::InvalidUuid(self.id.clone()))?;
        let customer_id = self
            .customer_id
            .as_deref()
            .map(|s| Uuid::parse_str(s).map_err(|_| DomainError::InvalidUuid(s.to_string())))
            .transpose()?;
        let total = Decimal::from_str(&self.total).map_err(|_| {
            DomainError::Validation(ValidationError::format("total", &format!("Invalid decimal: {}", self.total)))
        })?;
        let lines: Vec<SaleLine> = serde_json::from_str(&self.lines)?;

        Ok(Sale {
            id,
            customer_id,
            lines,
            total,
            payment_method: self.payment_method.parse()?,
            status: self.status.parse()?,
            completed_at: parse_optional_db_timestamp("completed_at", &self.completed_at)?,
            created_at: parse_db_timestamp("created_at", &self.created_at)?,
            updated_at: parse_db_timestamp("updated_at", &self.updated_at)?,
            deleted_at: parse_optional_db_timestamp("deleted_at", &self.deleted_at)?,
            receipt_number: self.receipt_number,
            version: self.version,
        })
    }
}
