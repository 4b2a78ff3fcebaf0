//! Broker abstraction for the nsc service mesh.
//!
//! [`Broker`] covers publish/subscribe/request plus handles for durable
//! streams ([`StreamAdmin`], [`StreamClient`]) and key-value buckets
//! ([`KvStore`]). Two implementations exist:
//!
//! - [`MemoryBroker`] (feature `memory`, default): an in-process bus for
//!   monolithic deployments and tests
//! - `NatsBroker` (feature `nats`): NATS core plus JetStream

mod error;
mod subject;
mod traits;
mod types;

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "config")]
mod config;

#[cfg(feature = "config")]
mod provider;

pub use error::BrokerError;
pub use subject::subject_matches;
pub use traits::{Broker, KvBucket, KvStore, StreamAdmin, StreamClient};
pub use types::{
    AckPolicy, Acker, BrokerKind, ConsumerConfig, DeliverPolicy, DiscardPolicy, Headers,
    IncomingMessage, KvBucketConfig, KvEntry, PubAck, ReplyHandle, Responder, RetentionPolicy,
    StatusEvent, StatusKind, StorageType, StreamConfig, StreamMessage, SubscribeOptions,
    Subscription,
};

#[cfg(feature = "memory")]
pub use memory::{MemoryBroker, MemoryBucket, MemoryKvStore, MemoryStreamClient, MemoryStreams};

#[cfg(feature = "nats")]
pub use nats::NatsBroker;

#[cfg(feature = "config")]
pub use config::BrokerConfig;

#[cfg(feature = "config")]
pub use provider::connect;
