use super::repository;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use kennel::services::{parse_timestamp, Filter, Record, RecordType};
use std::path::Path;

#[derive(Args)]
pub struct SearchArgs {
    /// Case-sensitive text matched against the record type's search fields
    #[arg(long)]
    term: Option<String>,

    /// Exact match on a category field (field=value), repeatable
    #[arg(short, long = "filter", value_parser = parse_category)]
    filters: Vec<(String, String)>,

    /// Only records below the low stock threshold
    #[arg(long)]
    low_stock: bool,

    /// Earliest timestamp (RFC 3339)
    #[arg(long, value_parser = parse_time)]
    from: Option<DateTime<Utc>>,

    /// Latest timestamp (RFC 3339)
    #[arg(long, value_parser = parse_time)]
    to: Option<DateTime<Utc>>,

    /// Maximum number of results
    #[arg(short, long)]
    limit: Option<u32>,

    /// Number of results to skip
    #[arg(long, default_value = "0")]
    offset: u32,
}

#[derive(Args)]
pub struct ListArgs {
    /// Maximum number of results
    #[arg(short, long)]
    limit: Option<u32>,

    /// Number of results to skip
    #[arg(long, default_value = "0")]
    offset: u32,
}

fn parse_category(text: &str) -> Result<(String, String)> {
    let (field, value) = text
        .split_once('=')
        .with_context(|| format!("Invalid filter '{}', expected field=value", text))?;
    let field = field.trim();
    if field.is_empty() {
        anyhow::bail!("Invalid filter '{}', field name is empty", text);
    }
    Ok((field.to_string(), value.trim().to_string()))
}

fn parse_time(text: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(text).with_context(|| format!("Invalid timestamp '{}'", text))
}

impl SearchArgs {
    fn filter(&self) -> Filter {
        let mut filter = Filter::new().with_offset(self.offset);
        if let Some(term) = &self.term {
            filter = filter.with_term(term.clone());
        }
        for (field, value) in &self.filters {
            filter = filter.with_category(field.clone(), value.clone());
        }
        if self.low_stock {
            filter = filter.with_low_stock_only(true);
        }
        if let Some(from) = self.from {
            filter = filter.with_from(from);
        }
        if let Some(to) = self.to {
            filter = filter.with_to(to);
        }
        if let Some(limit) = self.limit {
            filter = filter.with_limit(limit);
        }
        filter
    }
}

fn print_records(records: &[Record]) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(records)?);
    Ok(())
}

pub async fn execute_search(args: SearchArgs, config: &Path, record_type: RecordType) -> Result<()> {
    let repo = repository(config, record_type)?;

    let records = repo.search(&args.filter()).await?;
    tracing::info!("Found {} {} records", records.len(), record_type);
    print_records(&records)
}

pub async fn execute_list(args: ListArgs, config: &Path, record_type: RecordType) -> Result<()> {
    let repo = repository(config, record_type)?;

    let records = repo.list(args.limit, args.offset).await?;
    print_records(&records)
}
