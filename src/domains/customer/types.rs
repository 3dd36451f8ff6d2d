use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::domains::core::repository::Versioned;
use crate::errors::{DomainError, DomainResult};
use crate::types::{parse_db_timestamp, parse_optional_db_timestamp};
use crate::validation::{Validate, ValidationBuilder};

/// A customer known to the terminal (loyalty member, account holder)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: Uuid,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub loyalty_points: i64,
    pub notes: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Versioned for Customer {
    fn record_id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }
}

impl Customer {
    pub fn apply_update(&mut self, update: &UpdateCustomer) -> bool {
        let before = self.clone();
        if let Some(name) = &update.name {
            self.name = name.trim().to_string();
        }
        if let Some(phone) = &update.phone {
            self.phone = Some(phone.clone());
        }
        if let Some(email) = &update.email {
            self.email = Some(email.clone());
        }
        if let Some(points) = update.loyalty_points {
            self.loyalty_points = points;
        }
        if let Some(notes) = &update.notes {
            self.notes = Some(notes.clone());
        }
        *self != before
    }
}

/// DTO for creating a customer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCustomer {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub notes: Option<String>,
}

impl Validate for NewCustomer {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("name", Some(self.name.clone()))
            .required()
            .not_blank()
            .max_length(120)
            .validate()?;
        ValidationBuilder::new("phone", self.phone.clone()).phone().validate()?;
        ValidationBuilder::new("email", self.email.clone()).email().validate()?;
        ValidationBuilder::new("notes", self.notes.clone()).max_length(1000).validate()?;
        Ok(())
    }
}

/// DTO for a merge-update
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateCustomer {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub loyalty_points: Option<i64>,
    pub notes: Option<String>,
}

impl Validate for UpdateCustomer {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("name", self.name.clone())
            .not_blank()
            .max_length(120)
            .validate()?;
        ValidationBuilder::new("phone", self.phone.clone()).phone().validate()?;
        ValidationBuilder::new("email", self.email.clone()).email().validate()?;
        ValidationBuilder::new("loyalty_points", self.loyalty_points).min(0).validate()?;
        ValidationBuilder::new("notes", self.notes.clone()).max_length(1000).validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerFilter {
    /// Matches name, phone or email
    pub search_text: Option<String>,
    pub min_loyalty_points: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
pub struct CustomerRow {
    pub id: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub loyalty_points: i64,
    pub notes: Option<String>,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl CustomerRow {
    pub fn into_entity(self) -> DomainResult<Customer> {
        let id = Uuid::parse_str(&self.id).map_err(|_| DomainError::InvalidUuid(self.id.clone()))?;
        Ok(Customer {
            id,
            created_at: parse_db_timestamp("created_at", &self.created_at)?,
            updated_at: parse_db_timestamp("updated_at", &self.updated_at)?,
            deleted_at: parse_optional_db_timestamp("deleted_at", &self.deleted_at)?,
            name: self.name,
            phone: self.phone,
            email: self.email,
            loyalty_points: self.loyalty_points,
            notes: self.notes,
            version: self.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_details_are_validated() {
        let mut new = NewCustomer {
            name: "Ada".into(),
            phone: Some("+4412345678".into()),
            email: Some("ada@example.com".into()),
            notes: None,
        };
        assert!(new.validate().is_ok());

        new.email = Some("not-an-email".into());
        assert!(new.validate().is_err());

        let update = UpdateCustomer { loyalty_points: Some(-5), ..Default::default() };
        assert!(update.validate().is_err());
    }
}
