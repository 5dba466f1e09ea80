pub mod catalog;
pub mod config;
pub mod provision;
pub mod query;
pub mod repository;
pub mod schema;
pub mod types;

pub use catalog::RecordType;
pub use config::{ConfigService, StoreSettings};
pub use provision::ProvisioningSupervisor;
pub use query::{CompiledQuery, QueryCompiler};
pub use repository::RecordRepository;
pub use schema::{FieldKind, FieldSpec, LowStockFlag, RecordSchema};
pub use types::{format_timestamp, parse_timestamp, Filter, HealthResult, PageLimits, Record};

use crate::db::StoreError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),
}

impl DataError {
    /// Stable snake_case name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            DataError::NotFound(_) => "not_found",
            DataError::AlreadyExists(_) => "already_exists",
            DataError::Validation(_) => "validation",
            DataError::Unavailable(_) => "unavailable",
            DataError::ProvisioningFailed(_) => "provisioning_failed",
        }
    }
}

impl From<StoreError> for DataError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(message) => DataError::NotFound(message),
            StoreError::Conflict(message) => DataError::AlreadyExists(message),
            other => DataError::Unavailable(other.to_string()),
        }
    }
}
