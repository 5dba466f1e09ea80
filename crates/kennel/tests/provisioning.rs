use kennel::db::{ContainerRef, LazyConnection, StoreError};
use kennel::services::{HealthResult, ProvisioningSupervisor, RecordType};
use kennel::testing::{CountingConnector, MemoryStore, StaticTokenSource};
use std::sync::Arc;

struct TestContext {
    store: Arc<MemoryStore>,
    connector: Arc<CountingConnector>,
    supervisor: ProvisioningSupervisor,
    target: ContainerRef,
}

impl TestContext {
    fn new(record_type: RecordType, store: MemoryStore) -> Self {
        Self::with_connector(record_type, store, |connector| connector)
    }

    fn with_connector(
        record_type: RecordType,
        store: MemoryStore,
        configure: impl FnOnce(CountingConnector) -> CountingConnector,
    ) -> Self {
        let schema = record_type.schema();
        let store = Arc::new(store);
        let connector = Arc::new(configure(CountingConnector::new(store.clone())));
        let target = ContainerRef::new(schema.default_database, schema.default_container);
        let connection = LazyConnection::new(
            "https://localhost:8081/",
            Some("a2V5".to_string()),
            target.clone(),
            connector.clone(),
            Arc::new(StaticTokenSource::new("unused")),
        );
        let supervisor = ProvisioningSupervisor::new(Arc::new(connection), schema);
        Self {
            store,
            connector,
            supervisor,
            target,
        }
    }
}

fn seeded(result: &HealthResult) -> (bool, usize) {
    match result {
        HealthResult::Healthy {
            provisioned,
            seeded,
            ..
        } => (*provisioned, *seeded),
        other => panic!("expected healthy, got {:?}", other),
    }
}

fn unhealthy_kind(result: &HealthResult) -> String {
    match result {
        HealthResult::Unhealthy { kind, .. } => kind.clone(),
        other => panic!("expected unhealthy, got {:?}", other),
    }
}

#[tokio::test]
async fn provisioning_is_idempotent() {
    let ctx = TestContext::new(RecordType::Accessories, MemoryStore::new());

    let first = ctx.supervisor.check_or_provision().await;
    assert_eq!(seeded(&first), (true, 2));

    let second = ctx.supervisor.check_or_provision().await;
    assert_eq!(seeded(&second), (false, 0));

    assert_eq!(ctx.store.database_creations(), 1);
    assert_eq!(ctx.store.container_creations(), 1);
    assert_eq!(ctx.store.documents(&ctx.target).len(), 2);
    assert_eq!(ctx.connector.calls(), 1);
}

#[tokio::test]
async fn existing_container_is_not_touched() {
    let store = MemoryStore::with_container("petservice", "pets");
    let ctx = TestContext::new(RecordType::Pets, store);

    let result = ctx.supervisor.check_or_provision().await;
    assert_eq!(seeded(&result), (false, 0));
    assert_eq!(ctx.store.write_count(), 0);
    assert_eq!(ctx.store.container_creations(), 0);
}

#[tokio::test]
async fn existing_database_gets_missing_container() {
    let store = MemoryStore::with_container("petservice", "other");
    let ctx = TestContext::new(RecordType::Pets, store);

    let result = ctx.supervisor.check_or_provision().await;
    assert_eq!(seeded(&result), (true, 3));
    assert_eq!(ctx.store.database_creations(), 0);
    assert!(ctx.store.has_container(&ctx.target));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_instances_provision_and_seed_once() {
    let store = Arc::new(MemoryStore::new());
    let schema = RecordType::Pets.schema();
    let target = ContainerRef::new(schema.default_database, schema.default_container);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let connection = LazyConnection::new(
                "https://localhost:8081/",
                Some("a2V5".to_string()),
                target.clone(),
                Arc::new(CountingConnector::new(store.clone())),
                Arc::new(StaticTokenSource::new("unused")),
            );
            let supervisor = ProvisioningSupervisor::new(Arc::new(connection), schema);
            tokio::spawn(async move { supervisor.check_or_provision().await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(seeded(&handle.await.unwrap()));
    }
    outcomes.sort();

    assert_eq!(outcomes, vec![(false, 0), (false, 0), (false, 0), (true, 3)]);
    assert_eq!(store.documents(&target).len(), 3);
    assert_eq!(store.database_creations(), 1);
    assert_eq!(store.container_creations(), 1);
}

mod health_check_failures {
    use super::*;

    #[tokio::test]
    async fn non_not_found_errors_are_unhealthy_and_create_nothing() {
        for err in [
            StoreError::Unauthorized {
                status: 401,
                message: "bad signature".into(),
            },
            StoreError::Throttled("busy".into()),
            StoreError::Timeout("slow".into()),
            StoreError::Transport("reset".into()),
        ] {
            let store = MemoryStore::new();
            store.fail_queries_with(err);
            let ctx = TestContext::new(RecordType::Pets, store);

            let result = ctx.supervisor.check_or_provision().await;
            assert_eq!(unhealthy_kind(&result), "unavailable");
            assert_eq!(ctx.store.database_creations(), 0);
            assert_eq!(ctx.store.container_creations(), 0);
        }
    }

    #[tokio::test]
    async fn connection_failure_is_unavailable_then_recovers() {
        let ctx = TestContext::with_connector(RecordType::Pets, MemoryStore::new(), |c| {
            c.failing_first(1)
        });

        let result = ctx.supervisor.check_or_provision().await;
        assert_eq!(unhealthy_kind(&result), "unavailable");

        let result = ctx.supervisor.check_or_provision().await;
        assert_eq!(seeded(&result), (true, 3));
        assert_eq!(ctx.connector.calls(), 2);
    }
}

mod provisioning_failures {
    use super::*;

    #[tokio::test]
    async fn rejected_container_creation_is_provisioning_failed() {
        let store = MemoryStore::new();
        store.fail_container_creation_with(StoreError::Unauthorized {
            status: 403,
            message: "read-only key".into(),
        });
        let ctx = TestContext::new(RecordType::Activities, store);

        let result = ctx.supervisor.check_or_provision().await;
        assert_eq!(unhealthy_kind(&result), "provisioning_failed");
    }

    #[tokio::test]
    async fn rejected_database_creation_is_provisioning_failed() {
        let store = MemoryStore::new();
        store.fail_database_creation_with(StoreError::Status {
            status: 400,
            message: "bad name".into(),
        });
        let ctx = TestContext::new(RecordType::Pets, store);

        let result = ctx.supervisor.check_or_provision().await;
        assert_eq!(unhealthy_kind(&result), "provisioning_failed");
        assert_eq!(ctx.store.container_creations(), 0);
    }

    #[tokio::test]
    async fn partial_seed_failure_is_healthy_and_never_reseeded() {
        let store = MemoryStore::new();
        store.fail_creates_after(1, StoreError::Throttled("busy".into()));
        let ctx = TestContext::new(RecordType::Pets, store);

        let first = ctx.supervisor.check_or_provision().await;
        assert_eq!(seeded(&first), (true, 1));

        let second = ctx.supervisor.check_or_provision().await;
        assert_eq!(seeded(&second), (false, 0));
        assert_eq!(ctx.store.documents(&ctx.target).len(), 1);
    }
}

#[tokio::test]
async fn health_result_serializes_for_routing_layer() {
    let ctx = TestContext::new(RecordType::Pets, MemoryStore::new());
    let value = serde_json::to_value(ctx.supervisor.check_or_provision().await).unwrap();
    assert_eq!(value["status"], "healthy");
    assert_eq!(value["database"], "petservice");
    assert_eq!(value["container"], "pets");
    assert_eq!(value["seeded"], 3);
}
