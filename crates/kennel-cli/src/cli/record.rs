use super::{parse_object, repository};
use anyhow::Result;
use clap::Args;
use kennel::services::RecordType;
use std::path::Path;

#[derive(Args)]
pub struct CreateArgs {
    /// Record fields as a JSON object
    data: String,
}

#[derive(Args)]
pub struct IdArgs {
    /// Record ID
    id: String,
}

#[derive(Args)]
pub struct UpdateArgs {
    /// Record ID
    id: String,

    /// Fields to change as a JSON object; null clears an optional field
    data: String,
}

pub async fn execute_create(args: CreateArgs, config: &Path, record_type: RecordType) -> Result<()> {
    let input = parse_object(&args.data)?;
    let repo = repository(config, record_type)?;

    let record = repo.create(input).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

pub async fn execute_get(args: IdArgs, config: &Path, record_type: RecordType) -> Result<()> {
    let repo = repository(config, record_type)?;

    let record = repo.get_by_id(&args.id).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

pub async fn execute_update(args: UpdateArgs, config: &Path, record_type: RecordType) -> Result<()> {
    let patch = parse_object(&args.data)?;
    let repo = repository(config, record_type)?;

    let record = repo.partial_update(&args.id, patch).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

pub async fn execute_delete(args: IdArgs, config: &Path, record_type: RecordType) -> Result<()> {
    let repo = repository(config, record_type)?;

    repo.delete(&args.id).await?;
    println!("Deleted {} record: {}", record_type, args.id);
    Ok(())
}
