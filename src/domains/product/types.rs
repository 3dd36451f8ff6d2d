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

fn default_true() -> bool {
    true
}

/// A sellable item in the terminal's catalogue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: Uuid,
    pub sku: String,
    pub name: String,
    pub price: Decimal,
    #[serde(default)]
    pub stock_quantity: i64,
    pub category: Option<String>,
    pub barcode: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Versioned for Product {
    fn record_id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }
}

impl Product {
    /// Merge the supplied fields; untouched fields keep their values.
    /// Returns true if anything changed.
    pub fn apply_update(&mut self, update: &UpdateProduct) -> bool {
        let before = self.clone();
        if let Some(sku) = &update.sku {
            self.sku = sku.trim().to_string();
        }
        if let Some(name) = &update.name {
            self.name = name.trim().to_string();
        }
        if let Some(price) = update.price {
            self.price = price;
        }
        if let Some(qty) = update.stock_quantity {
            self.stock_quantity = qty;
        }
        if let Some(category) = &update.category {
            self.category = Some(category.clone());
        }
        if let Some(barcode) = &update.barcode {
            self.barcode = Some(barcode.clone());
        }
        if let Some(active) = update.active {
            self.active = active;
        }
        *self != before
    }
}

/// DTO for creating a product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProduct {
    pub sku: String,
    pub name: String,
    pub price: Decimal,
    pub stock_quantity: i64,
    pub category: Option<String>,
    pub barcode: Option<String>,
}

impl Validate for NewProduct {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("sku", Some(self.sku.clone()))
            .required()
            .sku()
            .validate()?;

        ValidationBuilder::new("name", Some(self.name.clone()))
            .not_blank()
            .max_length(200)
            .validate()?;

        ValidationBuilder::new("price", Some(self.price))
            .min(Decimal::ZERO)
            .validate()?;

        ValidationBuilder::new("barcode", self.barcode.clone())
            .max_length(64)
            .validate()?;

        Ok(())
    }
}

/// DTO for a merge-update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateProduct {
    pub sku: Option<String>,
    pub name: Option<String>,
    pub price: Option<Decimal>,
    pub stock_quantity: Option<i64>,
    pub category: Option<String>,
    pub barcode: Option<String>,
    pub active: Option<bool>,
}

impl Validate for UpdateProduct {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("sku", self.sku.clone()).sku().validate()?;
        ValidationBuilder::new("name", self.name.clone())
            .not_blank()
            .max_length(200)
            .validate()?;
        ValidationBuilder::new("price", self.price).min(Decimal::ZERO).validate()?;
        ValidationBuilder::new("barcode", self.barcode.clone()).max_length(64).validate()?;
        Ok(())
    }
}

/// List predicate for products
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductFilter {
    /// Matches name, sku or barcode
    pub search_text: Option<String>,
    pub category: Option<String>,
    pub active: Option<bool>,
    /// Only products with stock at or below this level
    pub max_stock: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ProductRow {
    pub id: String,
    pub sku: String,
    pub name: String,
    pub price: String,
    pub stock_quantity: i64,
    pub category: Option<String>,
    pub barcode: Option<String>,
    pub active: i64,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl ProductRow {
    pub fn into_entity(self) -> DomainResult<Product> {
        let id = Uuid::parse_str(&self.id).map_err(|_| DomainError::InvalidUuid(self.id.clone()))?;
        let price = Decimal::from_str(&self.price).map_err(|_| {
            DomainError::Validation(ValidationError::format("price", &format!("Invalid decimal: {}", self.price)))
        })?;

        Ok(Product {
            id,
            price,
            created_at: parse_db_timestamp("created_at", &self.created_at)?,
            updated_at: parse_db_timestamp("updated_at", &self.updated_at)?,
            deleted_at: parse_optional_db_timestamp("deleted_at", &self.deleted_at)?,
            sku: self.sku,
            name: self.name,
            stock_quantity: self.stock_quantity,
            category: self.category,
            barcode: self.barcode,
            active: self.active != 0,
            version: self.version,
        })
    }
}
