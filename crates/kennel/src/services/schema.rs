use super::types::{format_timestamp, parse_timestamp, RESERVED_FIELDS};
use super::DataError;
use serde_json::{Map, Value};

/// Value domain of a schema field
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    /// String with a character count in `min_len..=max_len`
    Text { min_len: usize, max_len: Option<usize> },
    /// Whole number in `min..=max`
    Integer { min: i64, max: Option<i64> },
    /// Finite number no smaller than `min`
    Number { min: f64 },
    /// One of a closed set of strings
    Category(&'static [&'static str]),
    /// RFC 3339 timestamp, stored normalized to UTC
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }

    /// Check a value against the field's domain and return its stored form
    pub fn validate(&self, value: &Value) -> Result<Value, DataError> {
        match self.kind {
            FieldKind::Text { min_len, max_len } => {
                let text = value
                    .as_str()
                    .ok_or_else(|| self.invalid("expected a string"))?;
                let len = text.chars().count();
                if len < min_len {
                    return Err(self.invalid(&format!("must be at least {} characters", min_len)));
                }
                if let Some(max_len) = max_len {
                    if len > max_len {
                        return Err(
                            self.invalid(&format!("must be at most {} characters", max_len))
                        );
                    }
                }
                Ok(Value::String(text.to_string()))
            },
            FieldKind::Integer { min, max } => {
                let number = whole_number(value).ok_or_else(|| self.invalid("expected an integer"))?;
                if number < min {
                    return Err(self.invalid(&format!("must be >= {}", min)));
                }
                if let Some(max) = max {
                    if number > max {
                        return Err(self.invalid(&format!("must be <= {}", max)));
                    }
                }
                Ok(Value::from(number))
            },
            FieldKind::Number { min } => {
                let number = value
                    .as_f64()
                    .filter(|n| n.is_finite())
                    .ok_or_else(|| self.invalid("expected a number"))?;
                if number < min {
                    return Err(self.invalid(&format!("must be >= {}", min)));
                }
                Ok(value.clone())
            },
            FieldKind::Category(allowed) => {
                let text = value
                    .as_str()
                    .ok_or_else(|| self.invalid("expected a string"))?;
                if !allowed.contains(&text) {
                    return Err(self.invalid(&format!("must be one of {}", allowed.join(", "))));
                }
                Ok(Value::String(text.to_string()))
            },
            FieldKind::Timestamp => {
                let at = value
                    .as_str()
                    .and_then(parse_timestamp)
                    .ok_or_else(|| self.invalid("expected an RFC 3339 timestamp"))?;
                Ok(Value::String(format_timestamp(&at)))
            },
        }
    }

    fn invalid(&self, reason: &str) -> DataError {
        DataError::Validation(format!("field '{}' {}", self.name, reason))
    }
}

/// Accepts integers and floats without a fractional part
fn whole_number(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        _ => None,
    }
}

/// Quantity field whose low values can be filtered on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowStockFlag {
    pub field: &'static str,
    /// Records with `field < threshold` count as low stock
    pub threshold: i64,
}

/// Description of one record type
#[derive(Debug, Clone, Copy)]
pub struct RecordSchema {
    pub name: &'static str,
    pub default_database: &'static str,
    pub default_container: &'static str,
    pub fields: &'static [FieldSpec],
    /// Text fields a search term is matched against
    pub search_fields: &'static [&'static str],
    /// Fields that accept equality filters
    pub filter_fields: &'static [&'static str],
    pub low_stock: Option<LowStockFlag>,
    /// Timestamp field accepting `from`/`to` range filters
    pub range_field: Option<&'static str>,
    /// Records inserted when the container is first created
    pub seeds: fn() -> Vec<Value>,
}

impl RecordSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    fn known_field(&self, name: &str) -> Result<&FieldSpec, DataError> {
        if RESERVED_FIELDS.contains(&name) {
            return Err(DataError::Validation(format!(
                "field '{}' is assigned by the store and cannot be set",
                name
            )));
        }
        self.field(name).ok_or_else(|| {
            DataError::Validation(format!("unknown field '{}' for {}", name, self.name))
        })
    }

    /// Validate input for a new record.
    ///
    /// Null values are treated as absent. Every required field must be present.
    pub fn validate_create(&self, input: &Map<String, Value>) -> Result<Map<String, Value>, DataError> {
        let mut fields = Map::new();
        for (name, value) in input {
            let spec = self.known_field(name)?;
            if value.is_null() {
                continue;
            }
            fields.insert(name.clone(), spec.validate(value)?);
        }

        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|field| field.required && !fields.contains_key(field.name))
            .map(|field| field.name)
            .collect();
        if !missing.is_empty() {
            return Err(DataError::Validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        Ok(fields)
    }

    /// Validate a sparse patch. Null clears an optional field.
    pub fn validate_patch(&self, patch: &Map<String, Value>) -> Result<Map<String, Value>, DataError> {
        let mut fields = Map::new();
        for (name, value) in patch {
            let spec = self.known_field(name)?;
            if value.is_null() {
                if spec.required {
                    return Err(DataError::Validation(format!(
                        "field '{}' is required and cannot be cleared",
                        name
                    )));
                }
                fields.insert(name.clone(), Value::Null);
                continue;
            }
            fields.insert(name.clone(), spec.validate(value)?);
        }
        Ok(fields)
    }

    /// Validate an equality filter value for `field`
    pub fn validate_filter(&self, field: &str, value: &str) -> Result<Value, DataError> {
        if !self.filter_fields.contains(&field) {
            return Err(DataError::Validation(format!(
                "{} cannot be filtered by '{}'",
                self.name, field
            )));
        }
        let spec = self.known_field(field)?;
        spec.validate(&Value::String(value.to_string()))
    }

    /// Seed documents without bookkeeping timestamps
    pub fn seed_documents(&self) -> Vec<Value> {
        (self.seeds)()
    }
}
