mod config;
mod health;
mod record;
mod search;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kennel::db::LazyConnection;
use kennel::services::{ConfigService, RecordRepository, RecordType, StoreSettings};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Parse a JSON object given on the command line
pub fn parse_object(text: &str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(text).context("Record data is not valid JSON")?;
    match value {
        Value::Object(map) => Ok(map),
        _ => Err(anyhow::anyhow!("Record data must be a JSON object")),
    }
}

#[derive(Parser)]
#[command(name = "kennel")]
#[command(about = "Operate the kennel pet, accessory and activity stores", long_about = None)]
pub struct Cli {
    /// Enable verbose output (info logs)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file
    #[arg(long, global = true, env = "KENNEL_CONFIG", default_value = "kennel.toml")]
    pub config: PathBuf,

    /// Record type to operate on (pets, accessories, activities)
    #[arg(
        short = 't',
        long,
        global = true,
        env = "KENNEL_RECORD_TYPE",
        default_value = "pets"
    )]
    pub record_type: RecordType,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check the store, provisioning and seeding it if missing
    Health,

    /// Create a record from a JSON object
    Create(record::CreateArgs),

    /// Get a record by ID
    Get(record::IdArgs),

    /// Merge a JSON patch into a record
    Update(record::UpdateArgs),

    /// Delete a record
    Delete(record::IdArgs),

    /// Search records
    Search(search::SearchArgs),

    /// List records, newest first
    List(search::ListArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}

/// Load settings from the configuration file and environment
pub fn load_settings(config: &Path) -> Result<StoreSettings> {
    ConfigService::new(config).load()
}

/// Shared lazy connection for a record type
pub fn connection(settings: &StoreSettings, record_type: RecordType) -> Result<Arc<LazyConnection>> {
    let connection = settings
        .lazy_connection(record_type.schema())
        .context("Failed to configure store connection")?;
    Ok(Arc::new(connection))
}

/// Repository for a record type; nothing connects until the first operation
pub fn repository(config: &Path, record_type: RecordType) -> Result<RecordRepository> {
    let settings = load_settings(config)?;
    let connection = connection(&settings, record_type)?;
    Ok(RecordRepository::new(
        connection,
        record_type.schema(),
        settings.page_limits(),
    ))
}

/// Execute the CLI command
pub async fn execute(cli: Cli) -> Result<()> {
    let config = cli.config;
    let record_type = cli.record_type;

    match cli.command {
        Commands::Health => health::execute(&config, record_type).await,
        Commands::Create(args) => record::execute_create(args, &config, record_type).await,
        Commands::Get(args) => record::execute_get(args, &config, record_type).await,
        Commands::Update(args) => record::execute_update(args, &config, record_type).await,
        Commands::Delete(args) => record::execute_delete(args, &config, record_type).await,
        Commands::Search(args) => search::execute_search(args, &config, record_type).await,
        Commands::List(args) => search::execute_list(args, &config, record_type).await,
        Commands::Config(args) => config::execute(args, &config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_object_accepts_objects_only() {
        let map = parse_object(r#"{"name": "Luna", "stock": 3}"#).unwrap();
        assert_eq!(map.len(), 2);
        assert!(parse_object("[1, 2]").is_err());
        assert!(parse_object("{not json").is_err());
    }

    #[test]
    fn record_type_flag_parses() {
        let cli = Cli::try_parse_from(["kennel", "--record-type", "accessories", "health"]).unwrap();
        assert_eq!(cli.record_type, RecordType::Accessories);
        assert!(Cli::try_parse_from(["kennel", "-t", "toys", "health"]).is_err());
    }
}
