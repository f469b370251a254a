//! Logical address field to source property key lookup table.
//!
//! Point-feature sources disagree on property names (`number` vs
//! `addr:housenumber` vs `HOUSE_NUM`). Each logical field has an ordered
//! list of accepted keys; the first key present with a non-null value
//! wins. The default table is embedded at compile time from
//! `field_keys.toml` and can be replaced at runtime.

use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::ExtractError;

/// Embedded default table.
const DEFAULT_FIELD_KEYS: &str = include_str!("../field_keys.toml");

/// Environment variable naming an override table.
pub const FIELD_KEYS_ENV: &str = "ADDRESS_MAP_FIELD_KEYS";

/// A logical address field resolved from feature properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressField {
    /// House number.
    HouseNumber,
    /// Street name.
    Street,
    /// Unit/apartment.
    Unit,
    /// City.
    City,
    /// Sub-region / district / county.
    District,
    /// Region / state.
    Region,
    /// Postal code.
    PostalCode,
    /// Pre-computed content hash.
    Hash,
}

/// Ordered accepted source keys for each [`AddressField`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FieldKeyTable {
    house_number: Vec<String>,
    street: Vec<String>,
    #[serde(default)]
    unit: Vec<String>,
    #[serde(default)]
    city: Vec<String>,
    #[serde(default)]
    district: Vec<String>,
    #[serde(default)]
    region: Vec<String>,
    #[serde(default)]
    postal_code: Vec<String>,
    #[serde(default)]
    hash: Vec<String>,
}

impl Default for FieldKeyTable {
    fn default() -> Self {
        Self::parse(DEFAULT_FIELD_KEYS).expect("Embedded field_keys.toml is invalid")
    }
}

impl FieldKeyTable {
    /// Parses a table from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError::FieldKeys`] if the TOML is invalid or a
    /// required field is missing.
    pub fn parse(toml_str: &str) -> Result<Self, ExtractError> {
        toml::from_str(toml_str).map_err(|e| ExtractError::FieldKeys {
            message: e.to_string(),
        })
    }

    /// Loads a table from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError`] if the file cannot be read or parsed.
    pub fn from_path(path: &Path) -> Result<Self, ExtractError> {
        let text = std::fs::read_to_string(path).map_err(|e| ExtractError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::parse(&text)
    }

    /// Loads the table named by `ADDRESS_MAP_FIELD_KEYS`, or the embedded
    /// default when the variable is unset.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractError`] if the override file cannot be loaded.
    pub fn from_env() -> Result<Self, ExtractError> {
        match std::env::var(FIELD_KEYS_ENV) {
            Ok(path) if !path.trim().is_empty() => {
                log::info!("Loading field key table from {path}");
                Self::from_path(Path::new(path.trim()))
            }
            _ => Ok(Self::default()),
        }
    }

    /// The accepted keys for `field`, in priority order.
    #[must_use]
    pub fn keys(&self, field: AddressField) -> &[String] {
        match field {
            AddressField::HouseNumber => &self.house_number,
            AddressField::Street => &self.street,
            AddressField::Unit => &self.unit,
            AddressField::City => &self.city,
            AddressField::District => &self.district,
            AddressField::Region => &self.region,
            AddressField::PostalCode => &self.postal_code,
            AddressField::Hash => &self.hash,
        }
    }

    /// Resolves `field` from a property bag.
    ///
    /// The first accepted key holding a string or number wins; numbers are
    /// coerced to text. The winning value is trimmed and an empty result
    /// is reported as `None`.
    #[must_use]
    pub fn resolve(&self, field: AddressField, properties: &Map<String, Value>) -> Option<String> {
        let raw = self
            .keys(field)
            .iter()
            .find_map(|key| match properties.get(key) {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })?;

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn props(value: &Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn embedded_table_parses() {
        let table = FieldKeyTable::default();
        assert_eq!(table.keys(AddressField::HouseNumber)[0], "number");
        assert!(!table.keys(AddressField::Hash).is_empty());
    }

    #[test]
    fn first_present_key_wins() {
        let table = FieldKeyTable::default();
        let p = props(&json!({
            "addr:street": "Second St",
            "street": "Oakley Ave",
        }));
        assert_eq!(
            table.resolve(AddressField::Street, &p).as_deref(),
            Some("Oakley Ave")
        );
    }

    #[test]
    fn null_values_fall_through_to_next_key() {
        let table = FieldKeyTable::default();
        let p = props(&json!({
            "number": null,
            "house_number": "2525",
        }));
        assert_eq!(
            table.resolve(AddressField::HouseNumber, &p).as_deref(),
            Some("2525")
        );
    }

    #[test]
    fn numbers_are_coerced_to_text() {
        let table = FieldKeyTable::default();
        let p = props(&json!({ "number": 2525, "zip": 45209 }));
        assert_eq!(
            table.resolve(AddressField::HouseNumber, &p).as_deref(),
            Some("2525")
        );
        assert_eq!(
            table.resolve(AddressField::PostalCode, &p).as_deref(),
            Some("45209")
        );
    }

    #[test]
    fn blank_values_resolve_to_none() {
        let table = FieldKeyTable::default();
        let p = props(&json!({ "city": "   " }));
        assert_eq!(table.resolve(AddressField::City, &p), None);
    }

    #[test]
    fn custom_table_changes_priority() {
        let table = FieldKeyTable::parse(
            r#"
            house_number = ["num"]
            street = ["rd", "street"]
            "#,
        )
        .unwrap();
        let p = props(&json!({ "street": "Oakley Ave", "rd": "Madison Rd", "num": "7" }));
        assert_eq!(
            table.resolve(AddressField::Street, &p).as_deref(),
            Some("Madison Rd")
        );
        assert_eq!(table.resolve(AddressField::City, &p), None);
    }

    #[test]
    fn rejects_table_without_required_fields() {
        assert!(matches!(
            FieldKeyTable::parse("city = [\"city\"]"),
            Err(ExtractError::FieldKeys { .. })
        ));
    }
}
