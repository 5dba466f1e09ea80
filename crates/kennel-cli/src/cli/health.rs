use super::{connection, load_settings};
use anyhow::Result;
use kennel::services::{HealthResult, ProvisioningSupervisor, RecordType};
use std::path::Path;

pub async fn execute(config: &Path, record_type: RecordType) -> Result<()> {
    let settings = load_settings(config)?;
    let connection = connection(&settings, record_type)?;
    let supervisor = ProvisioningSupervisor::new(connection, record_type.schema());

    let result = supervisor.check_or_provision().await;
    println!("{}", serde_json::to_string_pretty(&result)?);

    match result {
        HealthResult::Healthy { .. } => Ok(()),
        HealthResult::Unhealthy { kind, .. } => Err(anyhow::anyhow!(
            "{} store is unhealthy ({})",
            record_type,
            kind
        )),
    }
}
