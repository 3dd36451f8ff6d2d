use crate::errors::{ValidationError, DomainResult, DomainError};
use regex::Regex;
use std::sync::OnceLock;
use sqlx::{query_scalar, SqliteConnection};

/// A trait that entities should implement for validation.
pub trait Validate {
    /// Validates the entity and returns an error if validation fails.
    fn validate(&self) -> DomainResult<()>;
}

// Common regex patterns
fn email_regex() -> &'static Regex {
    static EMAIL_REGEX: OnceLock<Regex> = OnceLock::new();
    EMAIL_REGEX.get_or_init(|| Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap())
}

fn phone_regex() -> &'static Regex {
    static PHONE_REGEX: OnceLock<Regex> = OnceLock::new();
    PHONE_REGEX.get_or_init(|| Regex::new(r"^\+?[0-9]{8,15}$").unwrap())
}

fn sku_regex() -> &'static Regex {
    static SKU_REGEX: OnceLock<Regex> = OnceLock::new();
    SKU_REGEX.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,63}$").unwrap())
}

/// Struct for configuring validations in a fluent style
#[derive(Default)]
pub struct ValidationBuilder<T> {
    field_name: String,
    value: Option<T>,
    errors: Vec<ValidationError>,
}

/// Generic validation implementations
impl<T> ValidationBuilder<T> {
    pub fn new(field_name: &str, value: Option<T>) -> Self {
        Self {
            field_name: field_name.to_string(),
            value,
            errors: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self
    where T: Default + PartialEq {
        if self.value.is_none() || self.value == Some(T::default()) {
            self.errors.push(ValidationError::required(&self.field_name));
        }
        self
    }

    pub fn validate_with<F>(mut self, validator: F) -> Self
    where F: FnOnce(&T) -> Result<(), ValidationError> {
        if let Some(value) = &self.value {
            if let Err(err) = validator(value) {
                self.errors.push(err);
            }
        }
        self
    }

    /// Complete validation and return result
    pub fn validate(self) -> DomainResult<()> {
        match self.errors.into_iter().next() {
            // Return the first error for simplicity
            Some(err) => Err(DomainError::Validation(err)),
            None => Ok(()),
        }
    }
}

/// String-specific validations
impl ValidationBuilder<String> {
    pub fn max_length(mut self, max: usize) -> Self {
        if let Some(value) = &self.value {
            if value.chars().count() > max {
                self.errors.push(ValidationError::max_length(&self.field_name, max));
            }
        }
        self
    }

    pub fn not_blank(mut self) -> Self {
        if let Some(value) = &self.value {
            if value.trim().is_empty() {
                self.errors.push(ValidationError::required(&self.field_name));
            }
        }
        self
    }

    pub fn matches_pattern(mut self, pattern: &Regex, message: &str) -> Self {
        if let Some(value) = &self.value {
            if !pattern.is_match(value) {
                self.errors.push(ValidationError::format(&self.field_name, message));
            }
        }
        self
    }

    pub fn email(self) -> Self {
        self.matches_pattern(email_regex(), "must be a valid email address")
    }

    pub fn phone(self) -> Self {
        self.matches_pattern(phone_regex(), "must be a valid phone number")
    }

    pub fn sku(self) -> Self {
        self.matches_pattern(sku_regex(), "must be 1-64 letters, digits, '.', '_' or '-'")
    }
}

/// Numeric validations
impl<T> ValidationBuilder<T>
where T: PartialOrd + Clone + std::fmt::Display
{
    pub fn min(mut self, min: T) -> Self {
        if let Some(value) = &self.value {
            if value < &min {
                self.errors.push(ValidationError::range(
                    &self.field_name,
                    min.to_string(),
                    "maximum".to_string()
                ));
            }
        }
        self
    }

    pub fn range(mut self, min: T, max: T) -> Self {
        if let Some(value) = &self.value {
            if value < &min || value > &max {
                self.errors.push(ValidationError::range(
                    &self.field_name,
                    min.to_string(),
                    max.to_string()
                ));
            }
        }
        self
    }
}

/// Uniqueness check among live rows, run on the caller's connection so it
/// sees the same transaction as the write it guards.
pub async fn validate_unique(
    conn: &mut SqliteConnection,
    table: &str,
    field: &str,
    value: &str,
    exclude_id: Option<&str>,
    field_name: &str,
) -> DomainResult<()> {
    let count: i64 = match exclude_id {
        Some(id) => {
            let sql = format!(
                "SELECT COUNT(*) FROM {} WHERE {} = ? AND id != ? AND deleted_at IS NULL",
                table, field
            );
            query_scalar(&sql)
                .bind(value)
                .bind(id)
                .fetch_one(&mut *conn)
                .await?
        },
        None => {
            let sql = format!(
                "SELECT COUNT(*) FROM {} WHERE {} = ? AND deleted_at IS NULL",
                table, field
            );
            query_scalar(&sql)
                .bind(value)
                .fetch_one(&mut *conn)
                .await?
        }
    };

    if count > 0 {
        return Err(DomainError::Validation(ValidationError::unique(field_name)));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[test]
    fn string_rules() {
        assert!(ValidationBuilder::new("name", Some(String::new())).required().validate().is_err());
        assert!(ValidationBuilder::new("name", Some("  ".to_string())).not_blank().validate().is_err());
        assert!(ValidationBuilder::new("email", Some("a@b.co".to_string())).email().validate().is_ok());
        assert!(ValidationBuilder::new("email", Some("nope".to_string())).email().validate().is_err());
        assert!(ValidationBuilder::new("sku", Some("COF-250g".to_string())).sku().validate().is_ok());
        assert!(ValidationBuilder::new("sku", Some("bad sku".to_string())).sku().validate().is_err());
        // Absent optional values pass format checks
        assert!(ValidationBuilder::<String>::new("phone", None).phone().validate().is_ok());
    }

    #[test]
    fn numeric_rules() {
        assert!(ValidationBuilder::new("price", Some(dec!(-0.01))).min(Decimal::ZERO).validate().is_err());
        assert!(ValidationBuilder::new("price", Some(dec!(4.50))).min(Decimal::ZERO).validate().is_ok());
        assert!(ValidationBuilder::new("qty", Some(0i64)).range(1, 10_000).validate().is_err());
    }
}
