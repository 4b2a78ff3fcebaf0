//! Integration tests for dependency injection and service lifecycle.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use nsc_sdk::broker::{KvBucketConfig, MemoryBroker};
use nsc_sdk::container::BoxError;
use nsc_sdk::{Client, ConstructorArgs, Container, Dependency, MethodSettings, ServiceConfig};
use serde_json::{json, Value};

use common::fixtures::{self, Pool, Repository, POOL, REPOSITORY};
use common::{TestMesh, DEFAULT_TIMEOUT};

fn repository() -> Dependency {
    Dependency::adapter(|_: &ConstructorArgs| Ok::<_, BoxError>(Repository::new()))
}

#[tokio::test]
async fn singleton_adapters_are_built_once() {
    let container = Container::new();
    container.bind(REPOSITORY, repository().singleton());

    let first = container.get_instance_as::<Repository>(REPOSITORY).unwrap();
    let second = container.get_instance_as::<Repository>(REPOSITORY).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    container.unbind(REPOSITORY).await.unwrap();
    container.bind(REPOSITORY, repository());

    let first = container.get_instance_as::<Repository>(REPOSITORY).unwrap();
    let second = container.get_instance_as::<Repository>(REPOSITORY).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn adapters_are_injected_per_request() {
    let mesh = TestMesh::start().await;
    let client = mesh.client();
    let lookup = MethodSettings::new("Lookup");

    let first: Value = client.request_json("Math.Lookup", &json!({"id": 1}), &lookup).await.unwrap();
    let second: Value = client.request_json("Math.Lookup", &json!({"id": 2}), &lookup).await.unwrap();

    assert_eq!(first["name"], json!("ada"));
    assert_eq!(second["name"], json!("grace"));
    // Not a singleton, so each request builds its own repository.
    assert_ne!(first["repository"], second["repository"]);
    mesh.shutdown().await;
}

#[tokio::test]
async fn declared_buckets_are_injected() {
    let mesh = TestMesh::start().await;

    let reply: Value = mesh
        .client()
        .request_json(
            "Math.Remember",
            &json!({"key": "user", "value": "ada"}),
            &MethodSettings::new("Remember"),
        )
        .await
        .unwrap();
    assert_eq!(reply["revision"], json!(1));

    let bucket = mesh
        .math
        .broker()
        .key_value()
        .bucket("sessions", KvBucketConfig::default())
        .await
        .unwrap();
    let entry = bucket.get("user").await.unwrap().unwrap();
    assert_eq!(&entry.value[..], b"ada");
    mesh.shutdown().await;
}

#[tokio::test]
async fn service_dependencies_continue_the_trace() {
    let mesh = TestMesh::start().await;
    let gateway = fixtures::gateway_service(mesh.broker.clone())
        .build()
        .await
        .unwrap();
    gateway.start().await.unwrap();

    let root = gateway.root_baggage("Gateway.Proxy", None, None).unwrap();
    let client = Client::builder("Gateway", mesh.broker.clone())
        .default_timeout(DEFAULT_TIMEOUT)
        .baggage(root.clone())
        .build();

    let reply: Value = client
        .request_json("Gateway.Proxy", &json!({"a": 5, "b": 5}), &MethodSettings::new("Proxy"))
        .await
        .unwrap();

    assert_eq!(reply["result"], json!(10));
    assert_eq!(reply["traceId"], json!(root.trace_id));
    assert_eq!(reply["downstream"]["traceId"], json!(root.trace_id));
    assert_eq!(reply["downstream"]["expired"], json!(root.expired));

    assert!(gateway.end_root_span(&root.trace_id, None));
    assert_eq!(gateway.open_root_spans(), 0);
    gateway.shutdown().await;
    mesh.shutdown().await;
}

#[tokio::test]
async fn max_in_flight_bounds_concurrent_requests() {
    let mesh = TestMesh::start_with(|builder| {
        builder.config(ServiceConfig {
            max_in_flight: 1,
            ..common::test_config()
        })
    })
    .await;
    let client = mesh.client();
    let slow = MethodSettings::new("Slow");
    let empty = Value::Null;

    let calls = (0..4).map(|_| client.request_json::<_, Value>("Math.Slow", &empty, &slow));
    for result in join_all(calls).await {
        result.unwrap();
    }

    assert_eq!(mesh.gauge.peak(), 1);
    mesh.shutdown().await;
}

#[tokio::test]
async fn unbounded_services_handle_requests_concurrently() {
    let mesh = TestMesh::start_with(|builder| {
        builder.config(ServiceConfig {
            max_in_flight: 0,
            ..common::test_config()
        })
    })
    .await;
    let client = mesh.client();
    let slow = MethodSettings::new("Slow");
    let empty = Value::Null;

    let calls = (0..4).map(|_| client.request_json::<_, Value>("Math.Slow", &empty, &slow));
    for result in join_all(calls).await {
        result.unwrap();
    }

    assert!(mesh.gauge.peak() >= 2, "peak was {}", mesh.gauge.peak());
    mesh.shutdown().await;
}

#[tokio::test]
async fn lifecycle_adapters_open_at_start_and_close_at_shutdown() {
    let closed = Arc::new(AtomicBool::new(false));
    let flag = closed.clone();
    let container = Container::new();
    container.bind(
        POOL,
        Dependency::lifecycle_adapter(move |_: &ConstructorArgs| {
            Ok::<_, BoxError>(Pool {
                opened: AtomicBool::new(false),
                closed: flag.clone(),
            })
        }),
    );
    let extra = Arc::new(Pool::default());

    let service = common::service("Pools", Arc::new(MemoryBroker::new()))
        .container(Arc::new(container))
        .shutdown_resource(extra.clone())
        .build()
        .await
        .unwrap();
    service.start().await.unwrap();

    let pool = service.container().get_instance_as::<Pool>(POOL).unwrap();
    assert!(pool.opened.load(Ordering::SeqCst));
    assert!(!closed.load(Ordering::SeqCst));

    let abandoned = service.shutdown().await;
    assert!(abandoned.is_empty(), "abandoned: {abandoned:?}");
    assert!(closed.load(Ordering::SeqCst));
    assert!(extra.closed.load(Ordering::SeqCst));
    assert!(!service.is_running());
}
