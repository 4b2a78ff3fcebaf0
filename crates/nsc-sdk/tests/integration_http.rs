//! Integration tests for streaming methods served over HTTP.

mod common;

use std::time::Duration;

use futures::{stream, TryStreamExt};
use nsc_sdk::proto::subject::http_settings_subject;
use nsc_sdk::proto::{Envelope, HttpSettings};
use nsc_sdk::{MethodSettings, Payload, RequestError};
use reqwest::StatusCode;
use serde_json::{json, Value};

use common::fixtures::SumResponse;
use common::TestMesh;

fn fibonacci() -> MethodSettings {
    MethodSettings::new("Fibonacci").streaming(false, true)
}

fn base_url(mesh: &TestMesh) -> String {
    mesh.math.http_settings().unwrap().base_url()
}

#[tokio::test]
async fn fibonacci_streams_records() {
    let mesh = TestMesh::start().await;

    let reply = mesh
        .client()
        .call(Payload::json(&json!({"length": 4})).unwrap(), &fibonacci())
        .await
        .unwrap();
    assert!(reply.is_stream());

    let values: Vec<Value> = reply.into_records().try_collect().await.unwrap();
    assert_eq!(values, vec![json!(1), json!(1), json!(2), json!(3)]);
    mesh.shutdown().await;
}

#[tokio::test]
async fn streamed_request_gets_a_json_reply() {
    let mesh = TestMesh::start().await;
    let settings = MethodSettings::new("SumStream").streaming(true, false);

    let reply = mesh
        .client()
        .call(Payload::records(stream::iter(vec![1, 2, 3, 4])), &settings)
        .await
        .unwrap();

    let response: SumResponse = reply.decode().unwrap();
    assert_eq!(response.result, 10);
    mesh.shutdown().await;
}

#[tokio::test]
async fn streamed_responses_outlive_the_call_timeout() {
    let mesh = TestMesh::start().await;
    let ticks = MethodSettings::new("Ticks")
        .streaming(false, true)
        .with_timeout(Duration::from_millis(300));

    let reply = mesh
        .client()
        .call(Payload::json(&json!({"count": 4, "interval_ms": 150})).unwrap(), &ticks)
        .await
        .unwrap();

    // The deadline covers the call up to the response headers only.
    let values: Vec<Value> = reply.into_records().try_collect().await.unwrap();
    assert_eq!(values, vec![json!(0), json!(1), json!(2), json!(3)]);
    mesh.shutdown().await;
}

#[tokio::test]
async fn handler_failure_over_http_is_a_remote_error() {
    let mesh = TestMesh::start().await;

    let err = mesh
        .client()
        .call(Payload::json(&json!({"length": "four"})).unwrap(), &fibonacci())
        .await
        .unwrap_err();

    assert!(matches!(err, RequestError::Remote { .. }), "got {err:?}");
    mesh.shutdown().await;
}

#[tokio::test]
async fn listener_address_is_published_on_the_broker() {
    let mesh = TestMesh::start().await;
    let local = mesh.math.http_settings().unwrap();
    assert_ne!(local.port, 0);

    let reply = mesh
        .math
        .broker()
        .request(
            &http_settings_subject("Math"),
            bytes::Bytes::new(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    let published: HttpSettings = serde_json::from_slice(&reply).unwrap();
    assert_eq!(published, local);
    mesh.shutdown().await;
}

#[tokio::test]
async fn unknown_paths_and_methods_are_rejected() {
    let mesh = TestMesh::start().await;
    let base = base_url(&mesh);
    let http = reqwest::Client::new();

    let missing = http.post(format!("{base}/Math/Nope")).send().await.unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    let envelope = Envelope::decode(&missing.bytes().await.unwrap()).unwrap();
    assert!(envelope.error.is_some());

    // Broker methods are not routed over HTTP.
    let broker_only = http.post(format!("{base}/Math/Sum")).send().await.unwrap();
    assert_eq!(broker_only.status(), StatusCode::NOT_FOUND);

    let wrong_verb = http.get(format!("{base}/Math/Fibonacci")).send().await.unwrap();
    assert_eq!(wrong_verb.status(), StatusCode::METHOD_NOT_ALLOWED);

    let bad_body = http
        .post(format!("{base}/Math/Fibonacci"))
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(bad_body.status(), StatusCode::BAD_REQUEST);
    mesh.shutdown().await;
}
