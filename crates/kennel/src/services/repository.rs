use super::query::QueryCompiler;
use super::schema::RecordSchema;
use super::types::{format_timestamp, Filter, PageLimits, Record};
use super::DataError;
use crate::db::{ConnectionState, LazyConnection, QueryOptions, StoreError};
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;

/// CRUD and search over one record type
pub struct RecordRepository {
    connection: Arc<LazyConnection>,
    schema: &'static RecordSchema,
    limits: PageLimits,
}

impl RecordRepository {
    pub fn new(
        connection: Arc<LazyConnection>,
        schema: &'static RecordSchema,
        limits: PageLimits,
    ) -> Self {
        Self {
            connection,
            schema,
            limits,
        }
    }

    pub fn schema(&self) -> &'static RecordSchema {
        self.schema
    }

    /// Validate, stamp id and timestamps, and insert a new record
    pub async fn create(&self, input: Map<String, Value>) -> Result<Record, DataError> {
        let fields = self.schema.validate_create(&input)?;
        let state = self.connection.ensure_ready().await?;

        let record = Record::new(fields);
        let stored = state
            .client()
            .create_item(state.container(), &record.to_document())
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => DataError::AlreadyExists(format!(
                    "{} record '{}' already exists",
                    self.schema.name, record.id
                )),
                other => other.into(),
            })?;

        let record = self.decode(stored, &record.id)?;
        tracing::info!("Created {} record {}", self.schema.name, record.id);
        Ok(record)
    }

    /// Point read by id
    pub async fn get_by_id(&self, id: &str) -> Result<Record, DataError> {
        let id = self.check_id(id)?;
        let state = self.connection.ensure_ready().await?;
        self.read(state, id).await
    }

    /// Merge the keys present in `patch` into the stored record.
    ///
    /// An empty patch returns the record unchanged without writing. The merge
    /// works on the stored document, so keys outside the patch are written back
    /// exactly as they were read.
    pub async fn partial_update(
        &self,
        id: &str,
        patch: Map<String, Value>,
    ) -> Result<Record, DataError> {
        let id = self.check_id(id)?;
        let patch = self.schema.validate_patch(&patch)?;
        let state = self.connection.ensure_ready().await?;

        let document = self.read_document(state, id).await?;
        let current = self.decode(document.clone(), id)?;
        if patch.is_empty() {
            return Ok(current);
        }

        let mut stored = match document {
            Value::Object(map) => map,
            _ => return Err(self.undecodable(id, "not a JSON object")),
        };
        stored.retain(|key, _| !key.starts_with('_'));
        for (name, value) in patch {
            if value.is_null() {
                stored.remove(&name);
            } else {
                stored.insert(name, value);
            }
        }
        let updated_at = Utc::now().max(current.created_at);
        stored.insert(
            "updatedAt".to_string(),
            Value::String(format_timestamp(&updated_at)),
        );

        let written = state
            .client()
            .replace_item(state.container(), id, id, &Value::Object(stored))
            .await
            .map_err(|e| self.not_found(e, id))?;

        tracing::info!("Updated {} record {}", self.schema.name, id);
        self.decode(written, id)
    }

    /// Hard delete by id
    pub async fn delete(&self, id: &str) -> Result<(), DataError> {
        let id = self.check_id(id)?;
        let state = self.connection.ensure_ready().await?;

        state
            .client()
            .delete_item(state.container(), id, id)
            .await
            .map_err(|e| self.not_found(e, id))?;

        tracing::info!("Deleted {} record {}", self.schema.name, id);
        Ok(())
    }

    /// Run a filtered, paginated search across all partitions.
    ///
    /// Rows that cannot be mapped into a record are skipped. A missing database
    /// or container is reported as `Unavailable`, not `NotFound`: only point
    /// operations report `NotFound`, and only for a missing record. Provisioning
    /// happens on the health check path.
    pub async fn search(&self, filter: &Filter) -> Result<Vec<Record>, DataError> {
        let compiled = QueryCompiler::new(self.schema, self.limits).compile(filter)?;
        let state = self.connection.ensure_ready().await?;

        let options = QueryOptions::cross_partition()
            .with_max_item_count(compiled.limit)
            .with_window(compiled.window());
        let rows = state
            .client()
            .query_items(state.container(), &compiled.spec, options)
            .await
            .map_err(|e| DataError::Unavailable(e.to_string()))?;

        let records: Vec<Record> = rows
            .into_iter()
            .filter_map(|row| match Record::from_document(row) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!("Skipping malformed {} row: {}", self.schema.name, e);
                    None
                },
            })
            .collect();

        tracing::debug!(
            "Search on {} returned {} records",
            self.schema.name,
            records.len()
        );
        Ok(records)
    }

    /// One page of records, newest first
    pub async fn list(&self, limit: Option<u32>, offset: u32) -> Result<Vec<Record>, DataError> {
        let mut filter = Filter::new().with_offset(offset);
        filter.limit = limit;
        self.search(&filter).await
    }

    async fn read(&self, state: &ConnectionState, id: &str) -> Result<Record, DataError> {
        let document = self.read_document(state, id).await?;
        self.decode(document, id)
    }

    async fn read_document(&self, state: &ConnectionState, id: &str) -> Result<Value, DataError> {
        let document = state
            .client()
            .read_item(state.container(), id, id)
            .await
            .map_err(|e| self.not_found(e, id))?;
        tracing::debug!("Read {} record {}", self.schema.name, id);
        Ok(document)
    }

    fn check_id<'a>(&self, id: &'a str) -> Result<&'a str, DataError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(DataError::Validation("id must not be empty".to_string()));
        }
        Ok(id)
    }

    fn not_found(&self, err: StoreError, id: &str) -> DataError {
        match err {
            StoreError::NotFound(_) => {
                DataError::NotFound(format!("{} record '{}' not found", self.schema.name, id))
            },
            other => DataError::Unavailable(other.to_string()),
        }
    }

    fn decode(&self, document: Value, id: &str) -> Result<Record, DataError> {
        Record::from_document(document).map_err(|e| self.undecodable(id, e))
    }

    fn undecodable(&self, id: &str, reason: impl std::fmt::Display) -> DataError {
        DataError::Unavailable(format!(
            "stored {} record '{}' could not be decoded: {}",
            self.schema.name, id, reason
        ))
    }
}
