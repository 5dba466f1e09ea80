pub mod connection;
pub mod cosmos;
pub mod credential;

pub use connection::{ConnectionState, LazyConnection};
pub use credential::{AccessToken, Credential, CredentialMode, TokenSource};

use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;

/// Partition key path of every kennel container (records are partitioned by id)
pub const PARTITION_KEY_PATH: &str = "/id";

/// Errors reported by a document store client
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("resource already exists: {0}")]
    Conflict(String),

    #[error("request rejected with status {status}: {message}")]
    Unauthorized { status: u16, message: String },

    #[error("request throttled: {0}")]
    Throttled(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("store returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("failed to decode store response: {0}")]
    Decode(String),

    #[error("credential error: {0}")]
    Credential(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Address of a container inside a database account
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerRef {
    pub database: String,
    pub container: String,
}

impl ContainerRef {
    pub fn new(database: impl Into<String>, container: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            container: container.into(),
        }
    }

    /// Resource link of the owning database (`dbs/{db}`)
    pub fn database_link(&self) -> String {
        format!("dbs/{}", self.database)
    }

    /// Resource link of the container (`dbs/{db}/colls/{container}`)
    pub fn link(&self) -> String {
        format!("dbs/{}/colls/{}", self.database, self.container)
    }

    /// Resource link of a document inside the container
    pub fn document_link(&self, id: &str) -> String {
        format!("{}/docs/{}", self.link(), id)
    }
}

impl std::fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.database, self.container)
    }
}

/// Options for creating a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub id: String,
    pub partition_key_path: String,
    /// Manual throughput in RU/s; `None` leaves the account default
    pub throughput: Option<u32>,
}

impl ContainerSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            partition_key_path: PARTITION_KEY_PATH.to_string(),
            throughput: None,
        }
    }

    pub fn with_throughput(mut self, throughput: u32) -> Self {
        self.throughput = Some(throughput);
        self
    }
}

/// A named parameter bound to a query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryParameter {
    pub name: String,
    pub value: Value,
}

impl QueryParameter {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Query text plus its bound parameters, in the store's wire shape
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuerySpec {
    pub query: String,
    pub parameters: Vec<QueryParameter>,
}

impl QuerySpec {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.push(QueryParameter::new(name, value));
        self
    }

    /// Bind a parameter, replacing any value already bound to the name
    pub fn bind(mut self, name: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        match self.parameters.iter_mut().find(|p| p.name == name) {
            Some(parameter) => parameter.value = value,
            None => self.parameters.push(QueryParameter::new(name, value)),
        }
        self
    }

    /// Look up a bound value by parameter name
    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| &p.value)
    }
}

/// Ordering and page of a query whose partitions are merged by the client.
///
/// The query text must page with `OFFSET @offset LIMIT @limit`. Each partition
/// key range is asked for its first `offset + limit` rows, and [`QueryWindow::merge`]
/// orders the union and cuts the requested page out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryWindow {
    pub order_by: &'static str,
    pub descending: bool,
    pub offset: u32,
    pub limit: u32,
}

impl QueryWindow {
    pub const OFFSET_PARAMETER: &'static str = "@offset";
    pub const LIMIT_PARAMETER: &'static str = "@limit";

    /// The same query, rebound to return the whole prefix of one range
    pub fn range_query(&self, query: &QuerySpec) -> QuerySpec {
        query
            .clone()
            .bind(Self::OFFSET_PARAMETER, 0)
            .bind(Self::LIMIT_PARAMETER, self.offset.saturating_add(self.limit))
    }

    /// Order the rows of every range and return the requested page
    pub fn merge(&self, pages: Vec<Vec<Value>>) -> Vec<Value> {
        let mut rows: Vec<Value> = pages.into_iter().flatten().collect();
        rows.sort_by(|a, b| {
            let ordering = compare_order_values(a.get(self.order_by), b.get(self.order_by));
            if self.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
        rows.into_iter()
            .skip(self.offset as usize)
            .take(self.limit as usize)
            .collect()
    }
}

/// Store sort order: undefined, null, booleans, numbers, strings
fn compare_order_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(_) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Execution options for a query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub cross_partition: bool,
    pub max_item_count: Option<u32>,
    /// Merge ordered, paged results per partition key range on the client
    pub window: Option<QueryWindow>,
    /// Stop after the first page instead of following continuations
    pub single_page: bool,
}

impl QueryOptions {
    pub fn cross_partition() -> Self {
        Self {
            cross_partition: true,
            ..Self::default()
        }
    }

    pub fn with_max_item_count(mut self, count: u32) -> Self {
        self.max_item_count = Some(count);
        self
    }

    pub fn with_window(mut self, window: QueryWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn first_page_only(mut self) -> Self {
        self.single_page = true;
        self
    }
}

/// Outcome of a create-if-not-exists call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    Created,
    Existing,
}

/// Client handle for a remote document store account
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a database unless it already exists
    async fn create_database_if_not_exists(&self, database: &str) -> StoreResult<Provisioned>;

    /// Create a container unless it already exists
    async fn create_container_if_not_exists(
        &self,
        database: &str,
        spec: &ContainerSpec,
    ) -> StoreResult<Provisioned>;

    /// Insert a new document; fails with `Conflict` when the id is taken
    async fn create_item(&self, container: &ContainerRef, item: &Value) -> StoreResult<Value>;

    /// Point read by id and partition key
    async fn read_item(
        &self,
        container: &ContainerRef,
        id: &str,
        partition_key: &str,
    ) -> StoreResult<Value>;

    /// Replace a whole document
    async fn replace_item(
        &self,
        container: &ContainerRef,
        id: &str,
        partition_key: &str,
        item: &Value,
    ) -> StoreResult<Value>;

    /// Delete a document
    async fn delete_item(
        &self,
        container: &ContainerRef,
        id: &str,
        partition_key: &str,
    ) -> StoreResult<()>;

    /// Run a parameterized query and collect every page of results
    async fn query_items(
        &self,
        container: &ContainerRef,
        query: &QuerySpec,
        options: QueryOptions,
    ) -> StoreResult<Vec<Value>>;
}

/// Builds store clients for an endpoint and credential
#[async_trait::async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &str,
        credential: Credential,
    ) -> StoreResult<Arc<dyn DocumentStore>>;
}
