//! Integration tests for the in-process broker.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use nsc_broker::{
    connect, AckPolicy, Broker, BrokerConfig, ConsumerConfig, DeliverPolicy, KvBucketConfig,
    MemoryBroker, StreamConfig, SubscribeOptions,
};

#[tokio::test]
async fn queue_group_members_compete() {
    let broker = MemoryBroker::new();
    let a = broker
        .subscribe("Math.Sum", SubscribeOptions::queue("Math"))
        .await
        .unwrap();
    let b = broker
        .subscribe("Math.Sum", SubscribeOptions::queue("Math"))
        .await
        .unwrap();

    for _ in 0..4 {
        broker
            .publish("Math.Sum", Bytes::from_static(b"{}"), None)
            .await
            .unwrap();
    }

    let took_a: Vec<_> = a
        .take_until(tokio::time::sleep(Duration::from_millis(30)))
        .collect()
        .await;
    let took_b: Vec<_> = b
        .take_until(tokio::time::sleep(Duration::from_millis(30)))
        .collect()
        .await;
    assert_eq!(took_a.len() + took_b.len(), 4);
    assert_eq!(took_a.len(), 2);
}

#[tokio::test]
async fn brokers_are_isolated() {
    let first = MemoryBroker::new();
    let second = MemoryBroker::new();
    let mut sub = second
        .subscribe("Shared.subject", SubscribeOptions::default())
        .await
        .unwrap();

    first
        .publish("Shared.subject", Bytes::new(), None)
        .await
        .unwrap();

    let got = tokio::time::timeout(Duration::from_millis(30), sub.next_message()).await;
    assert!(got.is_err());
}

#[tokio::test]
async fn stream_roundtrip_through_trait_objects() {
    let broker: Arc<dyn Broker> = connect(&BrokerConfig::Memory).await.unwrap();
    let admin = broker.stream_manager();
    let client = broker.stream_client();

    admin
        .add_stream(StreamConfig::new("MathEvents", vec!["Math.events.>".into()]))
        .await
        .unwrap();
    admin
        .add_consumer(
            "MathEvents",
            ConsumerConfig {
                durable_name: "BillingElapsed".into(),
                filter_subject: "Math.events.elapsed".into(),
                ack_policy: AckPolicy::Explicit,
                ack_wait: Duration::from_secs(30),
                max_ack_pending: 10,
                deliver_policy: DeliverPolicy::New,
                deliver_group: None,
            },
        )
        .await
        .unwrap();

    broker
        .publish("Math.events.elapsed", Bytes::from_static(b"1"), None)
        .await
        .unwrap();

    let batch = client
        .fetch("MathEvents", "BillingElapsed", 10, Duration::from_millis(100))
        .await
        .unwrap();
    assert_eq!(batch.len(), 1);
    batch[0].ack().await.unwrap();
}

#[tokio::test]
async fn kv_buckets_are_shared_per_broker() {
    let broker = MemoryBroker::new();
    let bucket = broker
        .key_value()
        .bucket("sessions", KvBucketConfig::default())
        .await
        .unwrap();
    bucket.put("user", Bytes::from_static(b"1")).await.unwrap();

    let again = broker
        .key_value()
        .bucket("sessions", KvBucketConfig::default())
        .await
        .unwrap();
    assert_eq!(again.name(), "sessions");
    assert!(again.get("user").await.unwrap().is_some());
}
