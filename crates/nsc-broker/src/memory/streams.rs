use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use super::Bus;
use crate::error::BrokerError;
use crate::subject::subject_matches;
use crate::traits::{StreamAdmin, StreamClient};
use crate::types::{ConsumerConfig, IncomingMessage, PubAck, StreamConfig, StreamMessage, Subscription};

type ConsumerKey = (String, String);
type CursorRx = Arc<AsyncMutex<mpsc::UnboundedReceiver<IncomingMessage>>>;

struct Cursor {
    sub_id: u64,
    filter: String,
    rx: CursorRx,
}

/// Stream and consumer registry kept in memory.
///
/// Each durable consumer owns a bus subscription on its filter subject, so
/// messages published after the consumer exists queue up until read. Nothing
/// survives the process.
pub struct MemoryStreams {
    bus: Arc<Bus<IncomingMessage>>,
    streams: RwLock<HashMap<String, StreamConfig>>,
    consumers: RwLock<HashMap<ConsumerKey, ConsumerConfig>>,
    cursors: Mutex<HashMap<ConsumerKey, Cursor>>,
}

impl MemoryStreams {
    pub(crate) fn new(bus: Arc<Bus<IncomingMessage>>) -> Self {
        Self {
            bus,
            streams: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
        }
    }

    fn key(stream: &str, durable: &str) -> ConsumerKey {
        (stream.to_string(), durable.to_string())
    }

    fn require_stream(&self, name: &str) -> Result<(), BrokerError> {
        if self.streams.read().contains_key(name) {
            Ok(())
        } else {
            Err(BrokerError::StreamNotFound(name.to_string()))
        }
    }

    fn attach_cursor(&self, key: ConsumerKey, filter: &str) {
        let mut cursors = self.cursors.lock();
        if let Some(existing) = cursors.get(&key) {
            if existing.filter == filter {
                return;
            }
            self.bus.unsubscribe(existing.sub_id);
        }
        let (sub_id, rx) = self.bus.subscribe(filter, None);
        cursors.insert(
            key,
            Cursor {
                sub_id,
                filter: filter.to_string(),
                rx: Arc::new(AsyncMutex::new(rx)),
            },
        );
    }

    fn cursor(&self, stream: &str, durable: &str) -> Result<CursorRx, BrokerError> {
        self.cursors
            .lock()
            .get(&Self::key(stream, durable))
            .map(|c| c.rx.clone())
            .ok_or_else(|| BrokerError::ConsumerNotFound(durable.to_string()))
    }
}

#[async_trait]
impl StreamAdmin for MemoryStreams {
    async fn stream_info(&self, name: &str) -> Result<StreamConfig, BrokerError> {
        self.streams
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::StreamNotFound(name.to_string()))
    }

    async fn add_stream(&self, config: StreamConfig) -> Result<StreamConfig, BrokerError> {
        let mut streams = self.streams.write();
        if streams.contains_key(&config.name) {
            return Err(BrokerError::Backend(format!(
                "stream name already in use: {}",
                config.name
            )));
        }
        streams.insert(config.name.clone(), config.clone());
        Ok(config)
    }

    async fn update_stream(&self, config: StreamConfig) -> Result<StreamConfig, BrokerError> {
        let mut streams = self.streams.write();
        match streams.get_mut(&config.name) {
            Some(existing) => {
                *existing = config.clone();
                Ok(config)
            }
            None => Err(BrokerError::StreamNotFound(config.name)),
        }
    }

    async fn stream_names(&self) -> Result<Vec<String>, BrokerError> {
        let mut names: Vec<_> = self.streams.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn find_stream_by_subject(&self, subject: &str) -> Result<String, BrokerError> {
        self.streams
            .read()
            .values()
            .find(|s| s.subjects.iter().any(|p| subject_matches(p, subject)))
            .map(|s| s.name.clone())
            .ok_or_else(|| BrokerError::StreamNotFound(subject.to_string()))
    }

    async fn consumer_info(
        &self,
        stream: &str,
        durable: &str,
    ) -> Result<ConsumerConfig, BrokerError> {
        self.require_stream(stream)?;
        self.consumers
            .read()
            .get(&Self::key(stream, durable))
            .cloned()
            .ok_or_else(|| BrokerError::ConsumerNotFound(durable.to_string()))
    }

    async fn add_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerConfig, BrokerError> {
        self.require_stream(stream)?;
        let key = Self::key(stream, &config.durable_name);
        {
            let mut consumers = self.consumers.write();
            if consumers.contains_key(&key) {
                return Err(BrokerError::Backend(format!(
                    "consumer already exists: {}",
                    config.durable_name
                )));
            }
            consumers.insert(key.clone(), config.clone());
        }
        self.attach_cursor(key, &config.filter_subject);
        Ok(config)
    }

    async fn update_consumer(
        &self,
        stream: &str,
        config: ConsumerConfig,
    ) -> Result<ConsumerConfig, BrokerError> {
        self.require_stream(stream)?;
        let key = Self::key(stream, &config.durable_name);
        {
            let mut consumers = self.consumers.write();
            match consumers.get_mut(&key) {
                Some(existing) => *existing = config.clone(),
                None => return Err(BrokerError::ConsumerNotFound(config.durable_name)),
            }
        }
        self.attach_cursor(key, &config.filter_subject);
        Ok(config)
    }
}

/// Stream publish/consume over the in-process bus. Ack and nak are no-ops.
pub struct MemoryStreamClient {
    bus: Arc<Bus<IncomingMessage>>,
    streams: Arc<MemoryStreams>,
    sequence: AtomicU64,
}

impl MemoryStreamClient {
    pub(crate) fn new(bus: Arc<Bus<IncomingMessage>>, streams: Arc<MemoryStreams>) -> Self {
        Self {
            bus,
            streams,
            sequence: AtomicU64::new(0),
        }
    }
}

fn to_stream_message(message: IncomingMessage) -> StreamMessage {
    StreamMessage::new(message.subject, message.payload)
}

#[async_trait]
impl StreamClient for MemoryStreamClient {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<PubAck, BrokerError> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let stream = self
            .streams
            .find_stream_by_subject(subject)
            .await
            .unwrap_or_default();
        self.bus
            .emit(subject, &IncomingMessage::new(subject, payload));
        Ok(PubAck { stream, sequence })
    }

    async fn consume(
        &self,
        stream: &str,
        durable: &str,
    ) -> Result<Subscription<StreamMessage>, BrokerError> {
        let cursor = self.streams.cursor(stream, durable)?;
        let (tx, rx) = mpsc::unbounded_channel();

        let pump = tokio::spawn(async move {
            let mut source = cursor.lock().await;
            loop {
                tokio::select! {
                    next = source.recv() => match next {
                        Some(message) => {
                            if tx.send(to_stream_message(message)).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    () = tx.closed() => break,
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
        let cursor = self.streams.cursor(stream, durable)?;
        let mut batch = Vec::new();
        if max_messages == 0 {
            return Ok(batch);
        }

        let mut source = cursor.lock().await;
        match tokio::time::timeout(expires, source.recv()).await {
            Ok(Some(first)) => batch.push(to_stream_message(first)),
            Ok(None) | Err(_) => return Ok(batch),
        }
        while batch.len() < max_messages {
            match source.try_recv() {
                Ok(message) => batch.push(to_stream_message(message)),
                Err(_) => break,
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AckPolicy, DeliverPolicy};

    fn setup() -> (Arc<MemoryStreams>, MemoryStreamClient) {
        let bus = Arc::new(Bus::new());
        let streams = Arc::new(MemoryStreams::new(bus.clone()));
        let client = MemoryStreamClient::new(bus, streams.clone());
        (streams, client)
    }

    fn consumer(durable: &str, filter: &str) -> ConsumerConfig {
        ConsumerConfig {
            durable_name: durable.into(),
            filter_subject: filter.into(),
            ack_policy: AckPolicy::Explicit,
            ack_wait: Duration::from_secs(60),
            max_ack_pending: 10,
            deliver_policy: DeliverPolicy::New,
            deliver_group: None,
        }
    }

    #[tokio::test]
    async fn unknown_stream_is_not_found() {
        let (streams, _) = setup();
        let err = streams.stream_info("Missing").await.unwrap_err();
        assert!(matches!(err, BrokerError::StreamNotFound(_)));
    }

    #[tokio::test]
    async fn add_then_update_stream() {
        let (streams, _) = setup();
        streams
            .add_stream(StreamConfig::new("MathEvents", vec!["Math.events.>".into()]))
            .await
            .unwrap();
        assert!(streams
            .add_stream(StreamConfig::new("MathEvents", vec![]))
            .await
            .is_err());

        let mut updated = StreamConfig::new("MathEvents", vec!["Math.events.>".into()]);
        updated.num_replicas = 3;
        streams.update_stream(updated).await.unwrap();
        assert_eq!(streams.stream_info("MathEvents").await.unwrap().num_replicas, 3);
    }

    #[tokio::test]
    async fn find_stream_by_wildcard_subject() {
        let (streams, _) = setup();
        streams
            .add_stream(StreamConfig::new("MathEvents", vec!["Math.events.*".into()]))
            .await
            .unwrap();
        assert_eq!(
            streams.find_stream_by_subject("Math.events.elapsed").await.unwrap(),
            "MathEvents"
        );
        assert!(streams.find_stream_by_subject("Other.x").await.is_err());
    }

    #[tokio::test]
    async fn consumer_requires_stream() {
        let (streams, _) = setup();
        let err = streams
            .add_consumer("Missing", consumer("A", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::StreamNotFound(_)));
    }

    #[tokio::test]
    async fn fetch_returns_at_most_max() {
        let (streams, client) = setup();
        streams
            .add_stream(StreamConfig::new("S", vec!["s.>".into()]))
            .await
            .unwrap();
        streams.add_consumer("S", consumer("D", "s.e")).await.unwrap();

        for i in 0..5u8 {
            client.publish("s.e", Bytes::from(vec![i])).await.unwrap();
        }

        let batch = client
            .fetch("S", "D", 3, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(batch.len(), 3);
        let rest = client
            .fetch("S", "D", 10, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
        let empty = client
            .fetch("S", "D", 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn consume_delivers_in_order_and_acks_are_noops() {
        let (streams, client) = setup();
        streams
            .add_stream(StreamConfig::new("S", vec!["s.>".into()]))
            .await
            .unwrap();
        streams.add_consumer("S", consumer("D", "s.e")).await.unwrap();
        let mut sub = client.consume("S", "D").await.unwrap();

        client.publish("s.e", Bytes::from_static(b"1")).await.unwrap();
        client.publish("s.e", Bytes::from_static(b"2")).await.unwrap();

        let first = sub.next_message().await.unwrap();
        let second = sub.next_message().await.unwrap();
        assert_eq!(&first.payload[..], b"1");
        assert_eq!(&second.payload[..], b"2");
        first.ack().await.unwrap();
        second.nak(None).await.unwrap();
    }

    #[tokio::test]
    async fn publish_reports_owning_stream() {
        let (streams, client) = setup();
        streams
            .add_stream(StreamConfig::new("S", vec!["s.>".into()]))
            .await
            .unwrap();
        let ack = client.publish("s.e", Bytes::new()).await.unwrap();
        assert_eq!(ack.stream, "S");
        assert_eq!(ack.sequence, 1);
    }
}
