//! Common test utilities for service mesh integration tests.

#![allow(dead_code)]

pub mod fixtures;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use nsc_sdk::broker::{
    Broker, BrokerError, BrokerKind, Headers, IncomingMessage, KvStore, MemoryBroker, StatusEvent,
    StreamAdmin, StreamClient, SubscribeOptions, Subscription,
};
use nsc_sdk::{Client, RuntimeSettings, Service, ServiceBuilder, ServiceConfig};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use fixtures::Gauge;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Local environment, so services never bind the probe port.
pub fn local_runtime() -> RuntimeSettings {
    RuntimeSettings {
        environment: Some("local".to_string()),
        ..RuntimeSettings::default()
    }
}

/// Loopback HTTP listener and a short shutdown budget.
pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        http_host: IpAddr::from([127, 0, 0, 1]),
        graceful_shutdown_timeout_ms: 500,
        ..ServiceConfig::default()
    }
}

/// Service builder on `broker` with test defaults.
pub fn service(name: &str, broker: Arc<dyn Broker>) -> ServiceBuilder {
    Service::builder(name)
        .broker(broker)
        .runtime(local_runtime())
        .config(test_config())
        .default_timeout(DEFAULT_TIMEOUT)
}

/// In-process broker that records every request subject.
pub struct RecordingBroker {
    inner: MemoryBroker,
    requests: Mutex<Vec<String>>,
}

impl RecordingBroker {
    pub fn new() -> Self {
        Self {
            inner: MemoryBroker::new(),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of requests sent to `subject`.
    pub fn requests_to(&self, subject: &str) -> usize {
        self.requests.lock().iter().filter(|s| *s == subject).count()
    }

    pub fn total_requests(&self) -> usize {
        self.requests.lock().len()
    }
}

impl Default for RecordingBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for RecordingBroker {
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: Option<Headers>,
    ) -> Result<(), BrokerError> {
        self.inner.publish(subject, payload, headers).await
    }

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> Result<Subscription<IncomingMessage>, BrokerError> {
        self.inner.subscribe(subject, options).await
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BrokerError> {
        self.requests.lock().push(subject.to_string());
        self.inner.request(subject, payload, timeout).await
    }

    async fn drain(&self) -> Result<(), BrokerError> {
        self.inner.drain().await
    }

    fn status(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.status()
    }

    fn stream_manager(&self) -> Arc<dyn StreamAdmin> {
        self.inner.stream_manager()
    }

    fn stream_client(&self) -> Arc<dyn StreamClient> {
        self.inner.stream_client()
    }

    fn key_value(&self) -> Arc<dyn KvStore> {
        self.inner.key_value()
    }

    fn kind(&self) -> BrokerKind {
        BrokerKind::InProcess
    }
}

/// A started Math service on a recording in-process broker.
pub struct TestMesh {
    pub broker: Arc<RecordingBroker>,
    pub gauge: Arc<Gauge>,
    pub math: Service,
}

impl TestMesh {
    /// Starts the Math service with default test settings.
    pub async fn start() -> Self {
        Self::start_with(|builder| builder).await
    }

    /// Starts the Math service after `customise` has adjusted its builder.
    pub async fn start_with(customise: impl FnOnce(ServiceBuilder) -> ServiceBuilder) -> Self {
        let broker = Arc::new(RecordingBroker::new());
        let gauge = Arc::new(Gauge::default());
        let builder = fixtures::math_service(broker.clone(), "math-1", gauge.clone());
        let math = customise(builder).build().await.unwrap();
        math.start().await.unwrap();
        Self {
            broker,
            gauge,
            math,
        }
    }

    /// Standalone client for the Math service.
    pub fn client(&self) -> Client {
        Client::builder("Math", self.broker.clone())
            .default_timeout(DEFAULT_TIMEOUT)
            .build()
            .with_events(fixtures::math_events())
    }

    /// Stops the Math service and returns the resources it abandoned.
    pub async fn shutdown(&self) -> Vec<String> {
        self.math.shutdown().await
    }
}
