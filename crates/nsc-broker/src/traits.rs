use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::BrokerError;
use crate::types::{
    BrokerKind, ConsumerConfig, Headers, IncomingMessage, KvBucketConfig, KvEntry, PubAck,
    StatusEvent, StreamConfig, StreamMessage, SubscribeOptions, Subscription,
};

/// Publish/subscribe transport shared by clients and services.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: Option<Headers>,
    ) -> Result<(), BrokerError>;

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> Result<Subscription<IncomingMessage>, BrokerError>;

    /// Sends a request and waits for a single reply.
    ///
    /// Fails with [`BrokerError::Timeout`] when no reply arrives within `timeout`.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BrokerError>;

    /// Flushes pending traffic and stops accepting new deliveries.
    async fn drain(&self) -> Result<(), BrokerError>;

    /// Connection health events.
    fn status(&self) -> broadcast::Receiver<StatusEvent>;

    fn stream_manager(&self) -> Arc<dyn StreamAdmin>;

    fn stream_client(&self) -> Arc<dyn StreamClient>;

    fn key_value(&self) -> Arc<dyn KvStore>;

    fn kind(&self) -> BrokerKind;
}

/// Durable stream administration.
#[async_trait]
pub trait StreamAdmin: Send + Sync {
    /// Fails with [`BrokerError::StreamNotFound`] when no stream has this name.
    async fn stream_info(&self, name: &str) -> Result<StreamConfig, BrokerError>;

    async fn add_stream(&self, config: StreamConfig) -> Result<StreamConfig, BrokerError>;

    async fn update_stream(&self, config: StreamConfig) -> Result<StreamConfig, BrokerError>;

    async fn stream_names(&self) -> Result<Vec<String>, BrokerError>;

    /// Name of the stream capturing `subject`.
    async fn find_stream_by_subject(&self, subject: &str) -> Result<String, BrokerError>;

    /// Fails with [`BrokerError::ConsumerNotFound`] when the durable does not exist.
    async fn consumer_info(
        &self,
        stream: &str,
        durable: &str,
    ) -> Result<ConsumerConfig, BrokerError>;

    async fn add_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerConfig, BrokerError>;

    async fn update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerConfig, BrokerError>;
}

/// Durable stream publish and consume.
#[async_trait]
pub trait StreamClient: Send + Sync {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<PubAck, BrokerError>;

    /// Continuous delivery from a durable consumer, one message at a time.
    async fn consume(
        &self,
        stream: &str,
        durable: &str,
    ) -> Result<Subscription<StreamMessage>, BrokerError>;

    /// Pulls up to `max_messages`, waiting at most `expires` for the first one.
    async fn fetch(
        &self,
        stream: &str,
        durable: &str,
        max_messages: usize,
        expires: Duration,
    ) -> Result<Vec<StreamMessage>, BrokerError>;
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// Binds to the bucket, creating it when it does not exist.
    async fn bucket(
        &self,
        name: &str,
        config: KvBucketConfig,
    ) -> Result<Arc<dyn KvBucket>, BrokerError>;
}

#[async_trait]
pub trait KvBucket: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<KvEntry>, BrokerError>;

    async fn get_revision(&self, key: &str, revision: u64) -> Result<Option<KvEntry>, BrokerError>;

    /// Stores a value and returns its revision.
    async fn put(&self, key: &str, value: Bytes) -> Result<u64, BrokerError>;

    async fn delete(&self, key: &str) -> Result<(), BrokerError>;
}
