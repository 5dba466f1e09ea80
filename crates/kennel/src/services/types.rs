use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Names the store assigns or the repository stamps; never caller supplied
pub const RESERVED_FIELDS: [&str; 3] = ["id", "createdAt", "updatedAt"];

/// Render a timestamp as RFC 3339 UTC with microseconds and a `Z` suffix
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 timestamp. Timestamps without an offset are read as UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(text) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

mod timestamp {
    use super::{format_timestamp, parse_timestamp};
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timestamp(at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_timestamp(&text)
            .ok_or_else(|| de::Error::custom(format!("invalid timestamp '{}'", text)))
    }
}

/// A stored record: id, schema fields and bookkeeping timestamps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// Generate a new record id (UUID v4)
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Stamp a fresh id and timestamps onto validated fields
    pub fn new(fields: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: Self::generate_id(),
            fields,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Map a stored document back into a record, dropping store system properties
    pub fn from_document(document: Value) -> Result<Self, serde_json::Error> {
        let document = match document {
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .filter(|(key, _)| !key.starts_with('_'))
                    .collect(),
            ),
            other => other,
        };
        serde_json::from_value(document)
    }

    /// Flat JSON document in the stored shape
    pub fn to_document(&self) -> Value {
        let mut map = Map::with_capacity(self.fields.len() + 3);
        map.insert("id".to_string(), Value::String(self.id.clone()));
        for (key, value) in &self.fields {
            map.insert(key.clone(), value.clone());
        }
        map.insert(
            "createdAt".to_string(),
            Value::String(format_timestamp(&self.created_at)),
        );
        map.insert(
            "updatedAt".to_string(),
            Value::String(format_timestamp(&self.updated_at)),
        );
        Value::Object(map)
    }
}

/// Search parameters for a record type
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Free text matched against the schema's search fields
    pub term: Option<String>,
    /// Equality filters keyed by field name
    pub categories: BTreeMap<String, String>,
    pub low_stock_only: Option<bool>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Page size; the configured default applies when unset
    pub limit: Option<u32>,
    pub offset: u32,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_term(mut self, term: impl Into<String>) -> Self {
        self.term = Some(term.into());
        self
    }

    pub fn with_category(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.categories.insert(field.into(), value.into());
        self
    }

    pub fn with_low_stock_only(mut self, low_stock_only: bool) -> Self {
        self.low_stock_only = Some(low_stock_only);
        self
    }

    pub fn with_from(mut self, from: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self
    }

    pub fn with_to(mut self, to: DateTime<Utc>) -> Self {
        self.to = Some(to);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    /// Search term, treating blank text as absent
    pub fn term(&self) -> Option<&str> {
        self.term.as_deref().filter(|term| !term.trim().is_empty())
    }
}

/// Page size bounds applied to every search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_limit: 100,
            max_limit: 1000,
        }
    }
}

/// Outcome of a health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum HealthResult {
    Healthy {
        database: String,
        container: String,
        /// True when this check created the container
        #[serde(default)]
        provisioned: bool,
        /// Seed records inserted by this check
        #[serde(default)]
        seeded: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Unhealthy {
        database: String,
        container: String,
        error: String,
        kind: String,
    },
}

impl HealthResult {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthResult::Healthy { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    mod record {
        use super::*;

        #[test]
        fn new_generates_uuid_and_equal_timestamps() {
            let record = Record::new(Map::new());
            assert!(uuid::Uuid::parse_str(&record.id).is_ok());
            assert_eq!(record.created_at, record.updated_at);
            assert_ne!(Record::new(Map::new()).id, record.id);
        }

        #[test]
        fn from_document_strips_system_properties() {
            let record = Record::from_document(json!({
                "id": "p1",
                "name": "Luna",
                "createdAt": "2026-10-19T10:00:00.000000Z",
                "updatedAt": "2026-10-19T10:00:00.000000Z",
                "_rid": "abc",
                "_etag": "\"0000\"",
                "_ts": 1760868000
            }))
            .unwrap();

            assert_eq!(record.id, "p1");
            assert_eq!(record.fields.len(), 1);
            assert_eq!(record.field("name"), Some(&json!("Luna")));
        }

        #[test]
        fn from_document_accepts_naive_timestamps() {
            let record = Record::from_document(json!({
                "id": "p1",
                "createdAt": "2025-10-05T08:30:00.123456",
                "updatedAt": "2025-10-05T08:30:00"
            }))
            .unwrap();
            assert_eq!(
                record.updated_at,
                Utc.with_ymd_and_hms(2025, 10, 5, 8, 30, 0).unwrap()
            );
            assert!(record.created_at > record.updated_at);
        }

        #[test]
        fn from_document_rejects_missing_timestamps() {
            assert!(Record::from_document(json!({"id": "p1", "name": "Luna"})).is_err());
        }

        #[test]
        fn document_shape_is_flat_camel_case() {
            let at = Utc.with_ymd_and_hms(2026, 10, 19, 10, 0, 0).unwrap();
            let mut fields = Map::new();
            fields.insert("stock".to_string(), json!(45));
            let record = Record {
                id: "x1".to_string(),
                fields,
                created_at: at,
                updated_at: at,
            };

            let document = record.to_document();
            assert_eq!(
                document,
                json!({
                    "id": "x1",
                    "stock": 45,
                    "createdAt": "2026-10-19T10:00:00.000000Z",
                    "updatedAt": "2026-10-19T10:00:00.000000Z"
                })
            );
            assert_eq!(serde_json::to_value(&record).unwrap(), document);
        }
    }

    mod filter {
        use super::*;

        #[test]
        fn blank_term_is_absent() {
            assert_eq!(Filter::new().with_term("").term(), None);
            assert_eq!(Filter::new().with_term("   ").term(), None);
            assert_eq!(Filter::new().with_term("Luna").term(), Some("Luna"));
        }

        #[test]
        fn builders_accumulate() {
            let filter = Filter::new()
                .with_category("type", "toy")
                .with_low_stock_only(true)
                .with_limit(5)
                .with_offset(10);
            assert_eq!(filter.categories.get("type").map(String::as_str), Some("toy"));
            assert_eq!(filter.low_stock_only, Some(true));
            assert_eq!(filter.limit, Some(5));
            assert_eq!(filter.offset, 10);
        }
    }

    mod health {
        use super::*;

        #[test]
        fn healthy_serializes_with_status_tag() {
            let result = HealthResult::Healthy {
                database: "petservice".into(),
                container: "pets".into(),
                provisioned: false,
                seeded: 0,
                message: None,
            };
            assert!(result.is_healthy());
            assert_eq!(
                serde_json::to_value(&result).unwrap(),
                json!({
                    "status": "healthy",
                    "database": "petservice",
                    "container": "pets",
                    "provisioned": false,
                    "seeded": 0
                })
            );
        }

        #[test]
        fn unhealthy_carries_kind() {
            let result = HealthResult::Unhealthy {
                database: "petservice".into(),
                container: "pets".into(),
                error: "store unavailable: timeout".into(),
                kind: "unavailable".into(),
            };
            assert!(!result.is_healthy());
            let value = serde_json::to_value(&result).unwrap();
            assert_eq!(value["status"], "unhealthy");
            assert_eq!(value["kind"], "unavailable");
        }
    }

    #[test]
    fn timestamps_format_with_micros_and_z() {
        let at = parse_timestamp("2025-10-05T08:30:00+02:00").unwrap();
        assert_eq!(format_timestamp(&at), "2025-10-05T06:30:00.000000Z");
        assert!(parse_timestamp("yesterday").is_none());
    }
}
