use futures::future::join_all;
use kennel::db::{ContainerRef, CredentialMode, LazyConnection};
use kennel::services::DataError;
use kennel::testing::{CountingConnector, MemoryStore, StaticTokenSource};
use std::sync::Arc;
use std::time::Duration;

fn connection(endpoint: &str, key: Option<&str>, connector: Arc<CountingConnector>) -> LazyConnection {
    LazyConnection::new(
        endpoint,
        key.map(str::to_string),
        ContainerRef::new("petservice", "pets"),
        connector,
        Arc::new(StaticTokenSource::new("token")),
    )
}

#[tokio::test]
async fn concurrent_callers_share_one_initialization() {
    let connector = Arc::new(
        CountingConnector::new(Arc::new(MemoryStore::new())).with_delay(Duration::from_millis(50)),
    );
    let lazy = Arc::new(connection(
        "https://localhost:8081/",
        Some("a2V5"),
        connector.clone(),
    ));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let lazy = lazy.clone();
            tokio::spawn(async move { lazy.ensure_ready().await.map(|state| state.database().to_string()) })
        })
        .collect();

    for result in join_all(handles).await {
        assert_eq!(result.unwrap().unwrap(), "petservice");
    }
    assert_eq!(connector.calls(), 1);
}

#[tokio::test]
async fn concurrent_futures_on_one_task_share_initialization() {
    let connector = Arc::new(
        CountingConnector::new(Arc::new(MemoryStore::new())).with_delay(Duration::from_millis(10)),
    );
    let lazy = connection("https://localhost:8081/", Some("a2V5"), connector.clone());

    let results = join_all((0..8).map(|_| lazy.ensure_ready())).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(connector.calls(), 1);
}

#[tokio::test]
async fn failed_initialization_is_retried() {
    let connector =
        Arc::new(CountingConnector::new(Arc::new(MemoryStore::new())).failing_first(2));
    let lazy = connection("https://localhost:8081/", Some("a2V5"), connector.clone());

    for _ in 0..2 {
        assert!(matches!(
            lazy.ensure_ready().await,
            Err(DataError::Unavailable(_))
        ));
        assert!(!lazy.is_initialized());
    }

    assert!(lazy.ensure_ready().await.is_ok());
    assert!(lazy.is_initialized());
    assert_eq!(connector.calls(), 3);
}

#[tokio::test]
async fn credential_mode_follows_endpoint() {
    for (endpoint, expected) in [
        ("https://localhost:8081/", CredentialMode::StaticKey),
        ("https://127.0.0.1:8081/", CredentialMode::StaticKey),
        ("https://[::1]:8081/", CredentialMode::StaticKey),
        (
            "https://kennel.documents.azure.com:443/",
            CredentialMode::ManagedIdentity,
        ),
    ] {
        let connector = Arc::new(CountingConnector::new(Arc::new(MemoryStore::new())));
        let lazy = connection(endpoint, Some("a2V5"), connector.clone());

        let state = lazy.ensure_ready().await.unwrap();
        assert_eq!(state.mode(), expected, "{}", endpoint);
        assert_eq!(connector.modes(), vec![expected]);
    }
}

#[tokio::test]
async fn managed_identity_ignores_missing_key() {
    let connector = Arc::new(CountingConnector::new(Arc::new(MemoryStore::new())));
    let lazy = connection("https://kennel.documents.azure.com/", None, connector);
    assert!(lazy.ensure_ready().await.is_ok());
}

#[tokio::test]
async fn local_endpoint_requires_key() {
    let connector = Arc::new(CountingConnector::new(Arc::new(MemoryStore::new())));
    let lazy = connection("http://localhost:8081/", None, connector.clone());

    let err = lazy.ensure_ready().await.err().unwrap();
    assert!(err.to_string().contains("static key required"));
    assert_eq!(connector.calls(), 0);
}
