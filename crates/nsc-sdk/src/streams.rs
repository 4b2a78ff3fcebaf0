//! Durable stream provisioning and consumer construction.
//!
//! Streams are created or merge-updated at service start. Consumers are
//! created or updated on first listener registration and keep a
//! deterministic durable name, so they survive restarts.

use std::sync::Arc;
use std::time::Duration;

use nsc_broker::{
    AckPolicy, Broker, BrokerError, ConsumerConfig, DeliverPolicy, DiscardPolicy,
    RetentionPolicy, StorageType, StreamClient, StreamConfig, StreamMessage, Subscription,
};
use nsc_proto::subject::{consumer_name, event_subject, stream_name};
use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::events::{StreamAction, StreamOptions};

pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(14 * 24 * 60 * 60);
pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_REPLICAS: usize = 1;
pub const DEFAULT_MAX_ACK_PENDING: i64 = 10;
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(60);
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_BATCH_EXPIRES: Duration = Duration::from_millis(10_000);

/// Consumer settings for an event listener.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerOptions {
    /// Queue group. Plain subscriptions join it and durable push consumers
    /// use it as their deliver group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver: Option<DeliverPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pending: Option<i64>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_wait: Option<u64>,
    /// Deliver stream events in batches.
    #[serde(default)]
    pub batch: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pull_request_batch: Option<usize>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pull_request_expires: Option<u64>,
}

impl ListenerOptions {
    pub fn batched() -> Self {
        Self {
            batch: true,
            ..Self::default()
        }
    }

    fn ack_wait(&self) -> Duration {
        self.ack_wait
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_ACK_WAIT)
    }

    fn batch_size(&self) -> usize {
        self.max_pull_request_batch
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_BATCH_SIZE)
    }

    fn batch_expires(&self) -> Duration {
        self.max_pull_request_expires
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_BATCH_EXPIRES)
    }
}

/// Provisions the streams of one service and consumers of its events.
pub struct StreamManager {
    service: String,
    options: StreamOptions,
    broker: Arc<dyn Broker>,
}

impl StreamManager {
    pub fn new(service: impl Into<String>, options: StreamOptions, broker: Arc<dyn Broker>) -> Self {
        Self {
            service: service.into(),
            options,
            broker,
        }
    }

    /// Stream configuration for `action`, with defaults for unset fields.
    pub fn stream_config(&self, action: &StreamAction) -> StreamConfig {
        let name = stream_name(&self.service, &self.options.prefix, &action.action);
        let subject = event_subject(&self.service, Some(&self.options.prefix), &action.action);
        let mut config = StreamConfig::new(name, vec![subject]);
        config.storage = action.storage.unwrap_or(StorageType::File);
        config.retention = action.retention_policy.unwrap_or(RetentionPolicy::Limits);
        config.discard = action.discard_policy.unwrap_or(DiscardPolicy::Old);
        config.max_age = action
            .message_ttl
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_MESSAGE_TTL);
        config.duplicate_window = action
            .duplicate_tracking_time
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_DUPLICATE_WINDOW);
        config.num_replicas = action.replication.unwrap_or(DEFAULT_REPLICAS);
        config.allow_rollup = action.roll_ups.unwrap_or(true);
        config.max_bytes = action.max_bytes;
        config
    }

    /// Creates each declared stream, or merge-updates it when it already exists.
    pub async fn create_streams(&self) -> Result<Vec<StreamConfig>, StreamError> {
        let admin = self.broker.stream_manager();
        let mut applied = Vec::with_capacity(self.options.actions.len());
        for action in &self.options.actions {
            let config = self.stream_config(action);
            let result = match admin.stream_info(&config.name).await {
                Ok(existing) => {
                    tracing::debug!(stream = %config.name, "updating stream");
                    admin.update_stream(config.merged_onto(&existing)).await?
                }
                Err(BrokerError::StreamNotFound(_)) => {
                    tracing::info!(stream = %config.name, "creating stream");
                    admin.add_stream(config).await?
                }
                Err(err) => return Err(err.into()),
            };
            applied.push(result);
        }
        Ok(applied)
    }

    /// Creates or updates the durable consumer of `event` for `caller`.
    ///
    /// The owning stream must already exist.
    pub async fn create_consumer(
        &self,
        caller: &str,
        event: &str,
        options: &ListenerOptions,
    ) -> Result<ConsumerHandle, StreamError> {
        let admin = self.broker.stream_manager();
        let subject = event_subject(&self.service, Some(&self.options.prefix), event);
        let stream = match admin.find_stream_by_subject(&subject).await {
            Ok(stream) => stream,
            Err(BrokerError::StreamNotFound(_)) => {
                return Err(StreamError::Configuration(format!(
                    "no stream captures subject {subject}"
                )))
            }
            Err(err) => return Err(err.into()),
        };

        let durable = consumer_name(caller, event);
        let config = ConsumerConfig {
            durable_name: durable.clone(),
            filter_subject: subject,
            ack_policy: AckPolicy::Explicit,
            ack_wait: options.ack_wait(),
            max_ack_pending: options.max_pending.unwrap_or(DEFAULT_MAX_ACK_PENDING),
            deliver_policy: options.deliver.unwrap_or(DeliverPolicy::New),
            deliver_group: options.queue.clone(),
        };

        match admin.consumer_info(&stream, &durable).await {
            Ok(_) => {
                admin.update_consumer(&stream, config).await?;
            }
            Err(BrokerError::ConsumerNotFound(_)) => {
                admin.add_consumer(&stream, config).await?;
            }
            Err(err) => return Err(err.into()),
        }
        tracing::debug!(stream = %stream, durable = %durable, batch = options.batch, "consumer ready");

        let client = self.broker.stream_client();
        Ok(if options.batch {
            ConsumerHandle::Batch(BatchFetcher {
                client,
                stream,
                durable,
                max_messages: options.batch_size(),
                expires: options.batch_expires(),
            })
        } else {
            ConsumerHandle::Single(SingleFetcher {
                client,
                stream,
                durable,
            })
        })
    }
}

pub enum ConsumerHandle {
    Single(SingleFetcher),
    Batch(BatchFetcher),
}

/// One message at a time from a durable consumer.
pub struct SingleFetcher {
    client: Arc<dyn StreamClient>,
    stream: String,
    durable: String,
}

impl SingleFetcher {
    /// Starts delivery. Can be called again after the subscription ends.
    pub async fn subscribe(&self) -> Result<Subscription<StreamMessage>, BrokerError> {
        self.client.consume(&self.stream, &self.durable).await
    }

    pub fn durable(&self) -> &str {
        &self.durable
    }
}

/// Pull-based batches from a durable consumer.
pub struct BatchFetcher {
    client: Arc<dyn StreamClient>,
    stream: String,
    durable: String,
    max_messages: usize,
    expires: Duration,
}

impl BatchFetcher {
    /// Up to `max_messages`, waiting at most `expires` for the first.
    pub async fn fetch(&self) -> Result<Vec<StreamMessage>, BrokerError> {
        self.client
            .fetch(&self.stream, &self.durable, self.max_messages, self.expires)
            .await
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    pub fn expires(&self) -> Duration {
        self.expires
    }

    pub fn durable(&self) -> &str {
        &self.durable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nsc_broker::MemoryBroker;

    fn manager(broker: Arc<dyn Broker>) -> StreamManager {
        StreamManager::new(
            "Math",
            StreamOptions {
                prefix: "math".into(),
                actions: vec![StreamAction {
                    storage: Some(StorageType::Memory),
                    ..StreamAction::new("Notify")
                }],
            },
            broker,
        )
    }

    #[test]
    fn stream_config_applies_defaults() {
        let manager = manager(Arc::new(MemoryBroker::new()));
        let config = manager.stream_config(&StreamAction::new("Notify"));
        assert_eq!(config.name, "MathMathNotify");
        assert_eq!(config.subjects, vec!["Math.math.Notify".to_string()]);
        assert_eq!(config.storage, StorageType::File);
        assert_eq!(config.retention, RetentionPolicy::Limits);
        assert_eq!(config.discard, DiscardPolicy::Old);
        assert_eq!(config.max_age, DEFAULT_MESSAGE_TTL);
        assert_eq!(config.duplicate_window, DEFAULT_DUPLICATE_WINDOW);
        assert_eq!(config.num_replicas, 1);
        assert!(config.allow_rollup);
    }

    #[test]
    fn wildcard_actions_omit_suffix() {
        let manager = manager(Arc::new(MemoryBroker::new()));
        let config = manager.stream_config(&StreamAction::new("*"));
        assert_eq!(config.name, "MathMath");
        assert_eq!(config.subjects, vec!["Math.math.*".to_string()]);
    }

    #[tokio::test]
    async fn create_streams_is_idempotent() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let manager = manager(broker.clone());

        let first = manager.create_streams().await.unwrap();
        let second = manager.create_streams().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            broker.stream_manager().stream_names().await.unwrap(),
            vec!["MathMathNotify".to_string()]
        );
    }

    #[tokio::test]
    async fn consumer_without_stream_is_a_configuration_error() {
        let manager = manager(Arc::new(MemoryBroker::new()));
        let err = manager
            .create_consumer("Gateway", "Notify", &ListenerOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StreamError::Configuration(_)));
    }

    #[tokio::test]
    async fn consumer_creation_is_idempotent() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let manager = manager(broker.clone());
        manager.create_streams().await.unwrap();

        for _ in 0..2 {
            let handle = manager
                .create_consumer("Gateway", "Notify", &ListenerOptions::default())
                .await
                .unwrap();
            assert!(matches!(handle, ConsumerHandle::Single(ref f) if f.durable() == "GatewayNotify"));
        }
        let info = broker
            .stream_manager()
            .consumer_info("MathMathNotify", "GatewayNotify")
            .await
            .unwrap();
        assert_eq!(info.max_ack_pending, DEFAULT_MAX_ACK_PENDING);
        assert_eq!(info.ack_wait, DEFAULT_ACK_WAIT);
        assert_eq!(info.deliver_policy, DeliverPolicy::New);
        assert_eq!(info.deliver_group, None);
    }

    #[tokio::test]
    async fn listener_queue_becomes_the_deliver_group() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let manager = manager(broker.clone());
        manager.create_streams().await.unwrap();

        let options = ListenerOptions {
            queue: Some("workers".into()),
            ..ListenerOptions::default()
        };
        manager.create_consumer("Gateway", "Notify", &options).await.unwrap();
        let info = broker
            .stream_manager()
            .consumer_info("MathMathNotify", "GatewayNotify")
            .await
            .unwrap();
        assert_eq!(info.deliver_group.as_deref(), Some("workers"));

        // Updating an existing consumer carries the group too.
        let options = ListenerOptions {
            queue: Some("replicas".into()),
            ..ListenerOptions::default()
        };
        manager.create_consumer("Gateway", "Notify", &options).await.unwrap();
        let info = broker
            .stream_manager()
            .consumer_info("MathMathNotify", "GatewayNotify")
            .await
            .unwrap();
        assert_eq!(info.deliver_group.as_deref(), Some("replicas"));
    }

    #[tokio::test]
    async fn batch_options_select_batch_fetcher() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let manager = manager(broker);
        manager.create_streams().await.unwrap();

        let handle = manager
            .create_consumer("Gateway", "Notify", &ListenerOptions::batched())
            .await
            .unwrap();
        let ConsumerHandle::Batch(fetcher) = handle else {
            panic!("expected a batch fetcher");
        };
        assert_eq!(fetcher.max_messages(), DEFAULT_BATCH_SIZE);
        assert_eq!(fetcher.expires(), DEFAULT_BATCH_EXPIRES);
    }
}
