//! In-process broker used when no external broker is configured.

mod bus;
mod kv;
mod streams;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::traits::{Broker, KvStore, StreamAdmin, StreamClient};
use crate::types::{
    BrokerKind, Headers, IncomingMessage, ReplyHandle, Responder, StatusEvent, SubscribeOptions,
    Subscription,
};

pub(crate) use bus::Bus;
pub use kv::{MemoryBucket, MemoryKvStore};
pub use streams::{MemoryStreamClient, MemoryStreams};

const STATUS_CAPACITY: usize = 16;

/// Broker whose subjects live in process memory.
///
/// `request` registers a one-shot listener on a unique `_INBOX` subject and
/// races it against a timer. When the timer wins the listener stays
/// registered until its next delivery attempt finds the receiver gone; a late
/// reply is dropped.
#[derive(Clone)]
pub struct MemoryBroker {
    bus: Arc<Bus<IncomingMessage>>,
    streams: Arc<MemoryStreams>,
    stream_client: Arc<MemoryStreamClient>,
    kv: Arc<MemoryKvStore>,
    status: broadcast::Sender<StatusEvent>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let bus = Arc::new(Bus::new());
        let streams = Arc::new(MemoryStreams::new(bus.clone()));
        let stream_client = Arc::new(MemoryStreamClient::new(bus.clone(), streams.clone()));
        let (status, _) = broadcast::channel(STATUS_CAPACITY);
        Self {
            bus,
            streams,
            stream_client,
            kv: Arc::new(MemoryKvStore::new()),
            status,
        }
    }

    /// Injects a health event, as a network transport would on reconnects.
    pub fn emit_status(&self, event: StatusEvent) {
        let _ = self.status.send(event);
    }

    fn emit(&self, subject: &str, message: &IncomingMessage) -> usize {
        self.bus.emit(subject, message)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

struct BusResponder {
    bus: Arc<Bus<IncomingMessage>>,
    reply_subject: String,
}

#[async_trait]
impl Responder for BusResponder {
    async fn respond(&self, payload: Bytes) -> Result<(), BrokerError> {
        let message = IncomingMessage::new(self.reply_subject.clone(), payload);
        self.bus.emit(&self.reply_subject, &message);
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: Option<Headers>,
    ) -> Result<(), BrokerError> {
        let message = IncomingMessage::new(subject, payload).with_headers(headers);
        self.emit(subject, &message);
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
    ) -> Result<Subscription<IncomingMessage>, BrokerError> {
        let (id, rx) = self.bus.subscribe(subject, options.queue);
        let bus = self.bus.clone();
        Ok(Subscription::new(subject, rx, move || bus.unsubscribe(id)))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, BrokerError> {
        let reply_subject = format!("_INBOX.{}", Uuid::new_v4().simple());
        let (id, mut reply) = self.bus.subscribe(&reply_subject, None);

        let responder = BusResponder {
            bus: self.bus.clone(),
            reply_subject,
        };
        let message = IncomingMessage::new(subject, payload)
            .with_reply(ReplyHandle::new(Arc::new(responder)));
        self.emit(subject, &message);

        match tokio::time::timeout(timeout, reply.recv()).await {
            Ok(Some(response)) => {
                self.bus.unsubscribe(id);
                Ok(response.payload)
            }
            Ok(None) => Err(BrokerError::Closed),
            Err(_) => Err(BrokerError::Timeout),
        }
    }

    async fn drain(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    fn status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status.subscribe()
    }

    fn stream_manager(&self) -> Arc<dyn StreamAdmin> {
        self.streams.clone()
    }

    fn stream_client(&self) -> Arc<dyn StreamClient> {
        self.stream_client.clone()
    }

    fn key_value(&self) -> Arc<dyn KvStore> {
        self.kv.clone()
    }

    fn kind(&self) -> BrokerKind {
        BrokerKind::InProcess
    }
}
