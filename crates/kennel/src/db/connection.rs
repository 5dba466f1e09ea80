use super::credential::{self, Credential, CredentialMode, TokenSource};
use super::{ContainerRef, DocumentStore, StoreConnector};
use crate::services::DataError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Store handles published by a successful first connection
pub struct ConnectionState {
    client: Arc<dyn DocumentStore>,
    container: ContainerRef,
    mode: CredentialMode,
}

impl ConnectionState {
    pub fn client(&self) -> &Arc<dyn DocumentStore> {
        &self.client
    }

    pub fn database(&self) -> &str {
        &self.container.database
    }

    pub fn container(&self) -> &ContainerRef {
        &self.container
    }

    /// Credential mode the connection was established with
    pub fn mode(&self) -> CredentialMode {
        self.mode
    }
}

/// Connection that is established on first use and shared afterwards.
///
/// Concurrent callers of [`LazyConnection::ensure_ready`] wait on a single
/// initialization. A failed attempt publishes nothing, so the next call
/// starts over.
pub struct LazyConnection {
    endpoint: String,
    key: Option<String>,
    target: ContainerRef,
    connector: Arc<dyn StoreConnector>,
    token_source: Arc<dyn TokenSource>,
    connect_timeout: Duration,
    state: OnceCell<ConnectionState>,
}

impl LazyConnection {
    pub fn new(
        endpoint: impl Into<String>,
        key: Option<String>,
        target: ContainerRef,
        connector: Arc<dyn StoreConnector>,
        token_source: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            key,
            target,
            connector,
            token_source,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            state: OnceCell::new(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Database and container this connection is bound to
    pub fn target(&self) -> &ContainerRef {
        &self.target
    }

    pub fn is_initialized(&self) -> bool {
        self.state.initialized()
    }

    /// Return the connection state, connecting first if needed
    pub async fn ensure_ready(&self) -> Result<&ConnectionState, DataError> {
        if let Some(state) = self.state.get() {
            return Ok(state);
        }

        match tokio::time::timeout(
            self.connect_timeout,
            self.state.get_or_try_init(|| self.connect()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "Connection to {} timed out after {:?}",
                    self.endpoint,
                    self.connect_timeout
                );
                Err(DataError::Unavailable(format!(
                    "connection to {} timed out after {}s",
                    self.endpoint,
                    self.connect_timeout.as_secs_f64()
                )))
            },
        }
    }

    fn credential(&self, mode: CredentialMode) -> Result<Credential, DataError> {
        match mode {
            CredentialMode::StaticKey => self
                .key
                .as_deref()
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(|key| Credential::StaticKey(key.to_string()))
                .ok_or_else(|| {
                    DataError::Unavailable(format!(
                        "static key required for local endpoint {}",
                        self.endpoint
                    ))
                }),
            CredentialMode::ManagedIdentity => {
                Ok(Credential::ManagedIdentity(self.token_source.clone()))
            },
        }
    }

    async fn connect(&self) -> Result<ConnectionState, DataError> {
        let mode = credential::resolve(&self.endpoint);
        let credential = self.credential(mode)?;

        tracing::info!(
            "Connecting to {} ({}) with {} credentials",
            self.endpoint,
            self.target,
            mode
        );

        let client = self
            .connector
            .connect(&self.endpoint, credential)
            .await
            .map_err(|e| {
                tracing::warn!("Failed to connect to {}: {}", self.endpoint, e);
                DataError::Unavailable(format!("failed to connect to {}: {}", self.endpoint, e))
            })?;

        tracing::info!("Connected to {}", self.endpoint);
        Ok(ConnectionState {
            client,
            container: self.target.clone(),
            mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingConnector, MemoryStore, StaticTokenSource};

    fn lazy(endpoint: &str, key: Option<&str>, connector: Arc<CountingConnector>) -> LazyConnection {
        LazyConnection::new(
            endpoint,
            key.map(str::to_string),
            ContainerRef::new("petservice", "pets"),
            connector,
            Arc::new(StaticTokenSource::new("token")),
        )
    }

    #[tokio::test]
    async fn connects_once_and_reuses_state() {
        let connector = Arc::new(CountingConnector::new(Arc::new(MemoryStore::new())));
        let connection = lazy("https://localhost:8081/", Some("a2V5"), connector.clone());

        assert!(!connection.is_initialized());
        let state = connection.ensure_ready().await.unwrap();
        assert_eq!(state.database(), "petservice");
        assert_eq!(state.container().container, "pets");
        assert_eq!(state.mode(), CredentialMode::StaticKey);

        connection.ensure_ready().await.unwrap();
        assert!(connection.is_initialized());
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test]
    async fn local_endpoint_without_key_is_unavailable() {
        let connector = Arc::new(CountingConnector::new(Arc::new(MemoryStore::new())));
        let connection = lazy("https://127.0.0.1:8081/", Some("  "), connector.clone());

        let err = connection.ensure_ready().await.err().unwrap();
        assert_eq!(err.kind(), "unavailable");
        assert_eq!(connector.calls(), 0);
        assert!(!connection.is_initialized());
    }

    #[tokio::test]
    async fn remote_endpoint_uses_managed_identity() {
        let connector = Arc::new(CountingConnector::new(Arc::new(MemoryStore::new())));
        let connection = lazy("https://kennel.documents.azure.com:443/", None, connector.clone());

        let state = connection.ensure_ready().await.unwrap();
        assert_eq!(state.mode(), CredentialMode::ManagedIdentity);
        assert_eq!(connector.modes(), vec![CredentialMode::ManagedIdentity]);
    }

    #[tokio::test]
    async fn slow_connect_times_out() {
        let connector = Arc::new(
            CountingConnector::new(Arc::new(MemoryStore::new()))
                .with_delay(Duration::from_millis(200)),
        );
        let connection = lazy("https://localhost:8081/", Some("a2V5"), connector)
            .with_connect_timeout(Duration::from_millis(20));

        let err = connection.ensure_ready().await.err().unwrap();
        assert!(matches!(err, DataError::Unavailable(_)));
        assert!(!connection.is_initialized());
    }
}
