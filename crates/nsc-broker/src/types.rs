use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;

use crate::error::BrokerError;

pub type Headers = Vec<(String, String)>;

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Queue group; each message goes to one member of the group.
    pub queue: Option<String>,
}

impl SubscribeOptions {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            queue: Some(name.into()),
        }
    }
}

#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, payload: Bytes) -> Result<(), BrokerError>;
}

#[derive(Clone)]
pub struct ReplyHandle(Arc<dyn Responder>);

impl ReplyHandle {
    pub fn new(responder: Arc<dyn Responder>) -> Self {
        Self(responder)
    }
}

impl fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReplyHandle")
    }
}

/// A message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub subject: String,
    pub payload: Bytes,
    pub headers: Option<Headers>,
    reply: Option<ReplyHandle>,
}

impl IncomingMessage {
    pub fn new(subject: impl Into<String>, payload: Bytes) -> Self {
        Self {
            subject: subject.into(),
            payload,
            headers: None,
            reply: None,
        }
    }

    pub fn with_headers(mut self, headers: Option<Headers>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_reply(mut self, reply: ReplyHandle) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn is_respondable(&self) -> bool {
        self.reply.is_some()
    }

    pub async fn respond(&self, payload: Bytes) -> Result<(), BrokerError> {
        match &self.reply {
            Some(reply) => reply.0.respond(payload).await,
            None => Err(BrokerError::NoReplySubject),
        }
    }
}

/// A channel-fed sequence of deliveries.
///
/// Dropping the subscription, or calling [`Subscription::unsubscribe`],
/// detaches it from the transport.
pub struct Subscription<T = IncomingMessage> {
    subject: String,
    rx: mpsc::UnboundedReceiver<T>,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<T> Subscription<T> {
    pub fn new(
        subject: impl Into<String>,
        rx: mpsc::UnboundedReceiver<T>,
        detach: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            subject: subject.into(),
            rx,
            detach: Some(Box::new(detach)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub async fn next_message(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.detach_now();
    }

    fn detach_now(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
        self.rx.close();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    InProcess,
    Nats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Connected,
    Disconnected,
    Reconnecting,
    StaleConnection,
    PingTimer,
    SlowConsumer,
    Error,
    Closed,
    Other,
}

impl StatusKind {
    /// Transport-level chatter that is expected during normal operation.
    pub fn is_routine(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Reconnecting | Self::StaleConnection | Self::PingTimer
        )
    }
}

#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub kind: StatusKind,
    pub data: String,
}

impl StatusEvent {
    pub fn new(kind: StatusKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(rename_all = "lowercase"))]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(rename_all = "lowercase"))]
pub enum RetentionPolicy {
    #[default]
    Limits,
    Interest,
    #[cfg_attr(feature = "config", serde(alias = "work_queue"))]
    WorkQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(rename_all = "lowercase"))]
pub enum DiscardPolicy {
    #[default]
    Old,
    New,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
    pub storage: StorageType,
    pub num_replicas: usize,
    pub discard: DiscardPolicy,
    pub max_age: Duration,
    pub max_bytes: Option<i64>,
    pub max_msgs: Option<i64>,
    pub duplicate_window: Duration,
    pub allow_rollup: bool,
    pub description: Option<String>,
}

impl StreamConfig {
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            retention: RetentionPolicy::default(),
            storage: StorageType::default(),
            num_replicas: 1,
            discard: DiscardPolicy::default(),
            max_age: Duration::ZERO,
            max_bytes: None,
            max_msgs: None,
            duplicate_window: Duration::ZERO,
            allow_rollup: false,
            description: None,
        }
    }

    /// Overlays `self` on `existing`; optional fields left unset keep their existing values.
    pub fn merged_onto(self, existing: &StreamConfig) -> StreamConfig {
        StreamConfig {
            max_bytes: self.max_bytes.or(existing.max_bytes),
            max_msgs: self.max_msgs.or(existing.max_msgs),
            description: self.description.or_else(|| existing.description.clone()),
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "config", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "config", serde(rename_all = "lowercase"))]
pub enum DeliverPolicy {
    All,
    #[default]
    New,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    #[default]
    Explicit,
    All,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub durable_name: String,
    pub filter_subject: String,
    pub ack_policy: AckPolicy,
    pub ack_wait: Duration,
    pub max_ack_pending: i64,
    pub deliver_policy: DeliverPolicy,
    pub deliver_group: Option<String>,
}

#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn nak(&self, delay: Option<Duration>) -> Result<(), BrokerError>;
}

/// A message read from a durable stream.
#[derive(Clone)]
pub struct StreamMessage {
    pub subject: String,
    pub payload: Bytes,
    acker: Option<Arc<dyn Acker>>,
}

impl StreamMessage {
    pub fn new(subject: impl Into<String>, payload: Bytes) -> Self {
        Self {
            subject: subject.into(),
            payload,
            acker: None,
        }
    }

    pub fn with_acker(mut self, acker: Arc<dyn Acker>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// Acknowledges the message. Without an acker this resolves immediately.
    pub async fn ack(&self) -> Result<(), BrokerError> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    pub async fn nak(&self, delay: Option<Duration>) -> Result<(), BrokerError> {
        match &self.acker {
            Some(acker) => acker.nak(delay).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for StreamMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMessage")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("ackable", &self.acker.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubAck {
    pub stream: String,
    pub sequence: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvBucketConfig {
    /// Revisions kept per key.
    pub history: Option<i64>,
    pub ttl: Option<Duration>,
    pub max_bytes: Option<i64>,
    pub max_value_size: Option<i32>,
    pub storage: Option<StorageType>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Bytes,
    pub revision: u64,
}
