//! NATS core plus JetStream.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer, kv, stream, AckKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::error::BrokerError;
use crate::traits::{Broker, KvBucket, KvStore, StreamAdmin, StreamClient};
use crate::types::{
    AckPolicy, Acker, BrokerKind, ConsumerConfig, DeliverPolicy, DiscardPolicy, Headers,
    IncomingMessage, KvBucketConfig, KvEntry, PubAck, ReplyHandle, Responder, RetentionPolicy,
    StatusEvent, StatusKind, StorageType, StreamConfig, StreamMessage, SubscribeOptions,
    Subscription,
};

const STATUS_CAPACITY: usize = 64;
const STREAM_NOT_FOUND: &str = "stream not found";
const CONSUMER_NOT_FOUND: &str = "consumer not found";

#[derive(Clone)]
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    status: broadcast::Sender<StatusEvent>,
}

impl NatsBroker {
    pub async fn connect(url: &str, name: Option<&str>) -> Result<Self, BrokerError> {
        let (status, _) = broadcast::channel(STATUS_CAPACITY);
        let events = status.clone();

        let mut options = async_nats::ConnectOptions::new().event_callback(move |event| {
            let events = events.clone();
            async move {
                let _ = events.send(status_event(&event));
            }
        });
        if let Some(name) = name {
            options = options.name(name);
        }

        let client = options
            .connect(url)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            status,
        })
    }
}

fn status_event(event: &async_nats::Event) -> StatusEvent {
    let kind = match event {
        async_nats::Event::Connected => StatusKind::Connected,
        async_nats::Event::Disconnected => StatusKind::Disconnected,
        async_nats::Event::SlowConsumer(_) => StatusKind::SlowConsumer,
        async_nats::Event::ServerError(_) | async_nats::Event::ClientError(_) => {
            StatusKind::Error
        }
        _ => StatusKind::Other,
    };
    StatusEvent::new(kind, event.to_string())
}

fn backend<E: std::fmt::Display>(err: E) -> BrokerError {
    BrokerError::Backend(err.to_string())
}

fn to_header_map(headers: Headers) -> async_nats::HeaderMap {
    let mut map = async_nats::HeaderMap::new();
    for (name, value) in &headers {
        map.insert(name.as_str(), value.as_str());
    }
    map
}

struct NatsResponder {
    client: async_nats::Client,
    reply: String,
}

#[async_trait]
impl Responder for NatsResponder {
    async fn respond(&self, payload: Bytes) -> Result<(), BrokerError> {
        self.client
            .publish(self.reply.clone(), payload)
            .await
            .map_err(backend)
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: Option<Headers>,
    ) -> Result<(), BrokerError> {
        let subject = subject.to_string();
        match headers {
            Some(headers) => self
                .client
                .publish_with_headers(subject, to_header_map(headers), payload)
                .await
                .map_err(backend),
            None => self.client.publish(subject, payload).await.map_err(backend),
        }
    }

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> Result<Subscription<IncomingMessage>, BrokerError> {
        let mut subscriber = match options.queue {
            Some(queue) => self
                .client
                .queue_subscribe(subject.to_string(), queue)
                .await
                .map_err(backend)?,
            None => self
                .client
                .subscribe(subject.to_string())
                .await
                .map_err(backend)?,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let pump = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                let mut incoming = IncomingMessage::new(message.subject.to_string(), message.payload);
                if let Some(reply) = message.reply {
                    incoming = incoming.with_reply(ReplyHandle::new(Arc::new(NatsResponder {
                        client: client.clone(),
                        reply: reply.to_string(),
                    })));
                }
                if tx.send(incoming).is_err() {
                    break;
                }
            }
        });

        Ok(Subscription::new(subject, rx, move || pump.abort()))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BrokerError> {
        let request = async_nats::Request::new()
            .payload(payload)
            .timeout(Some(timeout));
        match self.client.send_request(subject.to_string(), request).await {
            Ok(message) => Ok(message.payload),
            Err(err) => Err(match err.kind() {
                async_nats::RequestErrorKind::TimedOut => BrokerError::Timeout,
                async_nats::RequestErrorKind::NoResponders => {
                    BrokerError::NoResponders(subject.to_string())
                }
                _ => backend(err),
            }),
        }
    }

    async fn drain(&self) -> Result<(), BrokerError> {
        self.client.flush().await.map_err(backend)
    }

    fn status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    fn stream_manager(&self) -> Arc<dyn StreamAdmin> {
        Arc::new(NatsStreams {
            jetstream: self.jetstream.clone(),
        })
    }

    fn stream_client(&self) -> Arc<dyn StreamClient> {
        Arc::new(NatsStreams {
            jetstream: self.jetstream.clone(),
        })
    }

    fn key_value(&self) -> Arc<dyn KvStore> {
        Arc::new(NatsStreams {
            jetstream: self.jetstream.clone(),
        })
    }

    fn kind(&self) -> BrokerKind {
        BrokerKind::Nats
    }
}

struct NatsStreams {
    jetstream: jetstream::Context,
}

fn to_nats_stream(config: &StreamConfig) -> stream::Config {
    stream::Config {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        retention: match config.retention {
            RetentionPolicy::Limits => stream::RetentionPolicy::Limits,
            RetentionPolicy::Interest => stream::RetentionPolicy::Interest,
            RetentionPolicy::WorkQueue => stream::RetentionPolicy::WorkQueue,
        },
        storage: match config.storage {
            StorageType::File => stream::StorageType::File,
            StorageType::Memory => stream::StorageType::Memory,
        },
        num_replicas: config.num_replicas,
        discard: match config.discard {
            DiscardPolicy::Old => stream::DiscardPolicy::Old,
            DiscardPolicy::New => stream::DiscardPolicy::New,
        },
        max_age: config.max_age,
        max_bytes: config.max_bytes.unwrap_or(-1),
        max_messages: config.max_msgs.unwrap_or(-1),
        duplicate_window: config.duplicate_window,
        allow_rollup: config.allow_rollup,
        description: config.description.clone(),
        ..Default::default()
    }
}

fn from_nats_stream(config: &stream::Config) -> StreamConfig {
    StreamConfig {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        retention: match config.retention {
            stream::RetentionPolicy::Limits => RetentionPolicy::Limits,
            stream::RetentionPolicy::Interest => RetentionPolicy::Interest,
            stream::RetentionPolicy::WorkQueue => RetentionPolicy::WorkQueue,
        },
        storage: match config.storage {
            stream::StorageType::File => StorageType::File,
            stream::StorageType::Memory => StorageType::Memory,
        },
        num_replicas: config.num_replicas,
        discard: match config.discard {
            stream::DiscardPolicy::New => DiscardPolicy::New,
            _ => DiscardPolicy::Old,
        },
        max_age: config.max_age,
        max_bytes: (config.max_bytes >= 0).then_some(config.max_bytes),
        max_msgs: (config.max_messages >= 0).then_some(config.max_messages),
        duplicate_window: config.duplicate_window,
        allow_rollup: config.allow_rollup,
        description: config.description.clone(),
    }
}

fn to_pull_consumer(config: &ConsumerConfig) -> consumer::pull::Config {
    consumer::pull::Config {
        durable_name: Some(config.durable_name.clone()),
        filter_subject: config.filter_subject.clone(),
        ack_policy: match config.ack_policy {
            AckPolicy::Explicit => consumer::AckPolicy::Explicit,
            AckPolicy::All => consumer::AckPolicy::All,
            AckPolicy::None => consumer::AckPolicy::None,
        },
        ack_wait: config.ack_wait,
        max_ack_pending: config.max_ack_pending,
        deliver_policy: match config.deliver_policy {
            DeliverPolicy::All => consumer::DeliverPolicy::All,
            DeliverPolicy::New => consumer::DeliverPolicy::New,
        },
        ..Default::default()
    }
}

fn from_consumer_info(info: &consumer::Info) -> ConsumerConfig {
    let config = &info.config;
    ConsumerConfig {
        durable_name: config.durable_name.clone().unwrap_or_else(|| info.name.clone()),
        filter_subject: config.filter_subject.clone(),
        ack_policy: match config.ack_policy {
            consumer::AckPolicy::All => AckPolicy::All,
            consumer::AckPolicy::None => AckPolicy::None,
            _ => AckPolicy::Explicit,
        },
        ack_wait: config.ack_wait,
        max_ack_pending: config.max_ack_pending,
        deliver_policy: match config.deliver_policy {
            consumer::DeliverPolicy::All => DeliverPolicy::All,
            _ => DeliverPolicy::New,
        },
        deliver_group: config.deliver_group.clone(),
    }
}

fn map_lookup_error<E: std::fmt::Display>(err: E, name: &str) -> BrokerError {
    let message = err.to_string();
    if message.contains(STREAM_NOT_FOUND) {
        BrokerError::StreamNotFound(name.to_string())
    } else if message.contains(CONSUMER_NOT_FOUND) {
        BrokerError::ConsumerNotFound(name.to_string())
    } else {
        BrokerError::Backend(message)
    }
}

impl NatsStreams {
    async fn pull_consumer(
        &self,
        stream: &str,
        durable: &str,
    ) -> Result<consumer::Consumer<consumer::pull::Config>, BrokerError> {
        let stream = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| map_lookup_error(e, stream))?;
        stream
            .get_consumer(durable)
            .await
            .map_err(|e| map_lookup_error(e, durable))
    }
}

struct JetStreamAcker(jetstream::Message);

#[async_trait]
impl Acker for JetStreamAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.0.ack().await.map_err(backend)
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), BrokerError> {
        self.0.ack_with(AckKind::Nak(delay)).await.map_err(backend)
    }
}

fn to_stream_message(message: jetstream::Message) -> StreamMessage {
    let subject = message.subject.to_string();
    let payload = message.payload.clone();
    StreamMessage::new(subject, payload).with_acker(Arc::new(JetStreamAcker(message)))
}

#[async_trait]
impl StreamAdmin for NatsStreams {
    async fn stream_info(&self, name: &str) -> Result<StreamConfig, BrokerError> {
        let stream = self
            .jetstream
            .get_stream(name)
            .await
            .map_err(|e| map_lookup_error(e, name))?;
        Ok(from_nats_stream(&stream.cached_info().config))
    }

    async fn add_stream(&self, config: StreamConfig) -> Result<StreamConfig, BrokerError> {
        let stream = self
            .jetstream
            .create_stream(to_nats_stream(&config))
            .await
            .map_err(backend)?;
        Ok(from_nats_stream(&stream.cached_info().config))
    }

    async fn update_stream(&self, config: StreamConfig) -> Result<StreamConfig, BrokerError> {
        let info = self
            .jetstream
            .update_stream(&to_nats_stream(&config))
            .await
            .map_err(|e| map_lookup_error(e, &config.name))?;
        Ok(from_nats_stream(&info.config))
    }

    async fn stream_names(&self) -> Result<Vec<String>, BrokerError> {
        let mut names = Vec::new();
        let mut listing = self.jetstream.stream_names();
        while let Some(name) = listing.next().await {
            names.push(name.map_err(backend)?);
        }
        names.sort();
        Ok(names)
    }

    async fn find_stream_by_subject(&self, subject: &str) -> Result<String, BrokerError> {
        self.jetstream
            .stream_by_subject(subject.to_string())
            .await
            .map_err(|e| {
                warn!(subject = %subject, error = %e, "stream lookup by subject failed");
                BrokerError::StreamNotFound(subject.to_string())
            })
    }

    async fn consumer_info(
        &self,
        stream: &str,
        durable: &str,
    ) -> Result<ConsumerConfig, BrokerError> {
        let consumer = self.pull_consumer(stream, durable).await?;
        Ok(from_consumer_info(consumer.cached_info()))
    }

    async fn add_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerConfig, BrokerError> {
        let handle = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| map_lookup_error(e, stream))?;
        let consumer = handle
            .create_consumer(to_pull_consumer(&config))
            .await
            .map_err(backend)?;
        Ok(from_consumer_info(consumer.cached_info()))
    }

    /// JetStream treats a create on an existing durable as an update.
    async fn update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerConfig, BrokerError> {
        self.add_consumer(stream, config).await
    }
}

#[async_trait]
impl StreamClient for NatsStreams {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<PubAck, BrokerError> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(backend)?
            .await
            .map_err(backend)?;
        Ok(PubAck {
            stream: ack.stream,
            sequence: ack.sequence,
        })
    }

    async fn consume(
        &self,
        stream: &str,
        durable: &str,
    ) -> Result<Subscription<StreamMessage>, BrokerError> {
        let consumer = self.pull_consumer(stream, durable).await?;
        let mut messages = consumer.messages().await.map_err(backend)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(async move {
            while let Some(next) = messages.next().await {
                match next {
                    Ok(message) => {
                        if tx.send(to_stream_message(message)).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "stream delivery failed"),
                }
            }
        });

        Ok(Subscription::new(durable, rx, move || pump.abort()))
    }

    async fn fetch(
        &self,
        stream: &str,
        durable: &str,
        max_messages: usize,
        expires: Duration,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let consumer = self.pull_consumer(stream, durable).await?;
        let mut batch = consumer
            .fetch()
            .max_messages(max_messages)
            .expires(expires)
            .messages()
            .await
            .map_err(backend)?;

        let mut out = Vec::with_capacity(max_messages);
        while let Some(next) = batch.next().await {
            out.push(to_stream_message(next.map_err(backend)?));
        }
        Ok(out)
    }
}

#[async_trait]
impl KvStore for NatsStreams {
    async fn bucket(
        &self,
        name: &str,
        config: KvBucketConfig,
    ) -> Result<Arc<dyn KvBucket>, BrokerError> {
        let store = match self.jetstream.get_key_value(name).await {
            Ok(store) => store,
            Err(_) => self
                .jetstream
                .create_key_value(kv::Config {
                    bucket: name.to_string(),
                    history: config.history.unwrap_or(1),
                    max_age: config.ttl.unwrap_or_default(),
                    max_bytes: config.max_bytes.unwrap_or(-1),
                    max_value_size: config.max_value_size.unwrap_or(-1),
                    storage: match config.storage.unwrap_or_default() {
                        StorageType::File => stream::StorageType::File,
                        StorageType::Memory => stream::StorageType::Memory,
                    },
                    ..Default::default()
                })
                .await
                .map_err(backend)?,
        };
        Ok(Arc::new(NatsBucket {
            name: name.to_string(),
            store,
        }))
    }
}

struct NatsBucket {
    name: String,
    store: kv::Store,
}

#[async_trait]
impl KvBucket for NatsBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &str) -> Result<Option<KvEntry>, BrokerError> {
        let entry = self.store.entry(key).await.map_err(backend)?;
        Ok(entry
            .filter(|e| e.operation == kv::Operation::Put)
            .map(|e| KvEntry {
                key: e.key,
                value: e.value,
                revision: e.revision,
            }))
    }

    async fn get_revision(&self, key: &str, revision: u64) -> Result<Option<KvEntry>, BrokerError> {
        let mut history = self.store.history(key).await.map_err(backend)?;
        while let Some(entry) = history.next().await {
            let entry = entry.map_err(backend)?;
            if entry.revision == revision && entry.operation == kv::Operation::Put {
                return Ok(Some(KvEntry {
                    key: entry.key,
                    value: entry.value,
                    revision: entry.revision,
                }));
            }
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<u64, BrokerError> {
        self.store.put(key, value).await.map_err(backend)
    }

    async fn delete(&self, key: &str) -> Result<(), BrokerError> {
        self.store.delete(key).await.map_err(backend)
    }
}
