use super::schema::RecordSchema;
use super::types::PageLimits;
use crate::db::cosmos::CosmosConnector;
use crate::db::credential::ImdsTokenSource;
use crate::db::{ContainerRef, LazyConnection};
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Environment variable prefix for store settings
pub const ENV_PREFIX: &str = "COSMOS_";

/// Connection and paging settings for the document store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Overrides the record type's default database
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    /// Overrides the record type's default container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// Skip TLS verification for the local emulator (static key mode only)
    #[serde(deserialize_with = "flag")]
    pub emulator_disable_ssl_verify: bool,
    pub connection_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub default_limit: u32,
    pub max_limit: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        let limits = PageLimits::default();
        Self {
            endpoint: None,
            key: None,
            database_name: None,
            container_name: None,
            emulator_disable_ssl_verify: false,
            connection_timeout_secs: 30,
            request_timeout_secs: 30,
            default_limit: limits.default_limit,
            max_limit: limits.max_limit,
        }
    }
}

/// Accepts booleans, 0/1 and the usual truthy strings
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => value,
        Flag::Int(value) => value != 0,
        Flag::Text(text) => matches!(
            text.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
    })
}

impl StoreSettings {
    /// Reject settings that cannot work regardless of the endpoint
    pub fn validate(&self) -> Result<()> {
        if self.connection_timeout_secs == 0 {
            anyhow::bail!("connection_timeout_secs must be greater than zero");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be greater than zero");
        }
        if self.default_limit == 0 {
            anyhow::bail!("default_limit must be greater than zero");
        }
        if self.default_limit > self.max_limit {
            anyhow::bail!(
                "default_limit ({}) must not exceed max_limit ({})",
                self.default_limit,
                self.max_limit
            );
        }
        Ok(())
    }

    /// Configured endpoint, required before connecting
    pub fn endpoint(&self) -> Result<&str> {
        self.endpoint
            .as_deref()
            .map(str::trim)
            .filter(|endpoint| !endpoint.is_empty())
            .with_context(|| format!("{}ENDPOINT is not set", ENV_PREFIX))
    }

    /// Database and container for a record type, honouring overrides
    pub fn target(&self, schema: &RecordSchema) -> ContainerRef {
        ContainerRef::new(
            self.database_name
                .clone()
                .unwrap_or_else(|| schema.default_database.to_string()),
            self.container_name
                .clone()
                .unwrap_or_else(|| schema.default_container.to_string()),
        )
    }

    pub fn page_limits(&self) -> PageLimits {
        PageLimits {
            default_limit: self.default_limit,
            max_limit: self.max_limit,
        }
    }

    pub fn connector(&self) -> CosmosConnector {
        CosmosConnector::new(
            Duration::from_secs(self.connection_timeout_secs),
            Duration::from_secs(self.request_timeout_secs),
        )
        .accept_invalid_certs(self.emulator_disable_ssl_verify)
    }

    /// Lazy connection to the production store for a record type
    pub fn lazy_connection(&self, schema: &RecordSchema) -> Result<LazyConnection> {
        let endpoint = self.endpoint()?;
        let timeout = Duration::from_secs(self.connection_timeout_secs);
        let token_source =
            ImdsTokenSource::from_env(timeout).context("Failed to configure managed identity")?;
        Ok(LazyConnection::new(
            endpoint,
            self.key.clone(),
            self.target(schema),
            Arc::new(self.connector()),
            Arc::new(token_source),
        )
        .with_connect_timeout(timeout))
    }

    /// Copy safe for display, with the account key masked
    pub fn redacted(&self) -> Self {
        Self {
            key: self.key.as_ref().map(|_| "********".to_string()),
            ..self.clone()
        }
    }
}

/// Service for configuration management
pub struct ConfigService {
    config_path: PathBuf,
    env_prefix: String,
}

impl ConfigService {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Check if the configuration file exists
    pub fn exists(&self) -> bool {
        self.config_path.exists()
    }

    /// Write a configuration file with defaults
    pub fn init(&self) -> Result<StoreSettings> {
        let settings = StoreSettings::default();
        self.save(&settings)?;
        Ok(settings)
    }

    /// Load defaults, then the TOML file if present, then the environment
    pub fn load(&self) -> Result<StoreSettings> {
        let mut figment = Figment::from(Serialized::defaults(StoreSettings::default()));

        if self.config_path.exists() {
            figment = figment.merge(Toml::file(&self.config_path));
        }

        figment = figment.merge(Env::prefixed(&self.env_prefix));

        let settings: StoreSettings = figment.extract().context("Failed to load configuration")?;
        settings.validate().context("Invalid configuration")?;
        Ok(settings)
    }

    /// Save configuration to file
    pub fn save(&self, settings: &StoreSettings) -> Result<()> {
        let content = toml::to_string_pretty(settings).context("Failed to serialize config")?;

        if let Some(parent) = self.config_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("Failed to create config directory")?;
            }
        }

        std::fs::write(&self.config_path, content).context("Failed to write config file")?;
        Ok(())
    }
}
