use super::schema::RecordSchema;
use super::types::{format_timestamp, HealthResult};
use super::DataError;
use crate::db::{
    ContainerRef, ContainerSpec, DocumentStore, LazyConnection, Provisioned, QueryOptions,
    QuerySpec, StoreError,
};
use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;

/// Cheapest query that fails with not-found when the container is missing.
/// Read as a single page of one item; TOP would need a cross-partition plan.
pub const HEALTH_QUERY: &str = "SELECT c.id FROM c";

/// Manual throughput (RU/s) of provisioned containers
pub const DEFAULT_THROUGHPUT: u32 = 400;

/// Health checks that create and seed a missing database and container
pub struct ProvisioningSupervisor {
    connection: Arc<LazyConnection>,
    schema: &'static RecordSchema,
    throughput: u32,
}

impl ProvisioningSupervisor {
    pub fn new(connection: Arc<LazyConnection>, schema: &'static RecordSchema) -> Self {
        Self {
            connection,
            schema,
            throughput: DEFAULT_THROUGHPUT,
        }
    }

    pub fn with_throughput(mut self, throughput: u32) -> Self {
        self.throughput = throughput;
        self
    }

    /// Check the container, provisioning it when the store reports it missing
    pub async fn check_or_provision(&self) -> HealthResult {
        let target = self.connection.target().clone();

        let state = match self.connection.ensure_ready().await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("Health check for {} failed to connect: {}", target, e);
                return unhealthy(&target, &e);
            },
        };
        let client = state.client();
        let container = state.container();

        let check = QuerySpec::new(HEALTH_QUERY);
        let options = QueryOptions::cross_partition()
            .with_max_item_count(1)
            .first_page_only();
        match client.query_items(container, &check, options).await {
            Ok(_) => HealthResult::Healthy {
                database: container.database.clone(),
                container: container.container.clone(),
                provisioned: false,
                seeded: 0,
                message: None,
            },
            Err(StoreError::NotFound(_)) => {
                tracing::info!("Container {} not found, provisioning", container);
                match self.provision(client.as_ref(), container).await {
                    Ok((provisioned, seeded)) => HealthResult::Healthy {
                        database: container.database.clone(),
                        container: container.container.clone(),
                        provisioned,
                        seeded,
                        message: provisioned.then(|| {
                            format!(
                                "container {} was created and seeded with {} sample records",
                                container, seeded
                            )
                        }),
                    },
                    Err(e) => {
                        tracing::error!("Provisioning {} failed: {}", container, e);
                        unhealthy(container, &e)
                    },
                }
            },
            Err(e) => {
                let e = DataError::Unavailable(e.to_string());
                tracing::error!("Health check for {} failed: {}", container, e);
                unhealthy(container, &e)
            },
        }
    }

    /// Returns whether the container was created by this call and how many seeds went in
    async fn provision(
        &self,
        client: &dyn DocumentStore,
        container: &ContainerRef,
    ) -> Result<(bool, usize), DataError> {
        client
            .create_database_if_not_exists(&container.database)
            .await
            .map_err(|e| {
                DataError::ProvisioningFailed(format!(
                    "failed to create database {}: {}",
                    container.database, e
                ))
            })?;

        let spec = ContainerSpec::new(container.container.as_str()).with_throughput(self.throughput);
        let outcome = client
            .create_container_if_not_exists(&container.database, &spec)
            .await
            .map_err(|e| {
                DataError::ProvisioningFailed(format!(
                    "failed to create container {}: {}",
                    container, e
                ))
            })?;

        if outcome == Provisioned::Existing {
            tracing::info!("Container {} already exists, skipping seed", container);
            return Ok((false, 0));
        }

        let seeded = self.seed(client, container).await;
        tracing::info!("Provisioned {} with {} seed records", container, seeded);
        Ok((true, seeded))
    }

    async fn seed(&self, client: &dyn DocumentStore, container: &ContainerRef) -> usize {
        let now = Value::String(format_timestamp(&Utc::now()));
        let documents: Vec<Value> = self
            .schema
            .seed_documents()
            .into_iter()
            .map(|mut document| {
                if let Value::Object(map) = &mut document {
                    map.insert("createdAt".to_string(), now.clone());
                    map.insert("updatedAt".to_string(), now.clone());
                }
                document
            })
            .collect();

        let results = join_all(documents.iter().map(|document| async move {
            let id = document.get("id").and_then(Value::as_str).unwrap_or("?");
            match client.create_item(container, document).await {
                Ok(_) => {
                    tracing::info!("Seeded {} record {}", self.schema.name, id);
                    true
                },
                Err(StoreError::Conflict(_)) => {
                    tracing::info!("Seed record {} already exists, skipping", id);
                    false
                },
                Err(e) => {
                    tracing::warn!("Failed to seed record {}: {}", id, e);
                    false
                },
            }
        }))
        .await;

        results.into_iter().filter(|inserted| *inserted).count()
    }
}

fn unhealthy(target: &ContainerRef, error: &DataError) -> HealthResult {
    HealthResult::Unhealthy {
        database: target.database.clone(),
        container: target.container.clone(),
        error: error.to_string(),
        kind: error.kind().to_string(),
    }
}
