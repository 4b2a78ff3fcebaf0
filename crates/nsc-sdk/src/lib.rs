//! Runtime for services on the nsc mesh.
//!
//! A service declares methods (request/response handlers addressed by
//! `<service>.<action>`), events and dependencies, then serves them over a
//! [`Broker`](nsc_broker::Broker). Streaming methods are served over HTTP.
//! Callers use [`Client`], which applies validation, deadlines and caching
//! before picking a transport.
//!
//! # Example
//!
//! ```no_run
//! use nsc_sdk::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[derive(Deserialize)]
//! struct SumRequest {
//!     a: f64,
//!     b: f64,
//! }
//!
//! struct Sum;
//!
//! #[async_trait]
//! impl Method for Sum {
//!     fn settings() -> MethodSettings {
//!         MethodSettings::new("Sum")
//!     }
//!
//!     fn build(_: ResolvedDependencies, _: MethodContext) -> Result<Self, HandlerError> {
//!         Ok(Sum)
//!     }
//!
//!     async fn handle(&mut self, request: Payload) -> Result<Payload, HandlerError> {
//!         let SumRequest { a, b } = request.decode()?;
//!         Ok(Payload::json(&serde_json::json!({ "result": a + b }))?)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ServiceError> {
//!     nsc_sdk::telemetry::init_logging();
//!     let service = Service::builder("Math")
//!         .broker(Arc::new(MemoryBroker::new()))
//!         .default_timeout(Duration::from_secs(5))
//!         .method::<Sum>()
//!         .build()
//!         .await?;
//!     service.run().await;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod container;
pub mod error;
pub mod events;
pub mod kv;
pub mod method;
pub mod payload;
pub mod prelude;
pub mod service;
pub mod streams;
pub mod telemetry;
pub mod validation;

pub use cache::{cache_key, CacheBackend, CacheError, CacheSettings, MemoryCache};
pub use client::{
    Client, ClientBuilder, ClientParts, EventDelivery, EventListener, EventMessage, HandlerId,
    ServiceClient,
};
pub use config::{ConfigError, RuntimeSettings, ServiceConfig};
pub use container::{
    AdapterOptions, Container, ContainerError, ConstructorArgs, Dependency, DependencyKey,
    DependencyRequest, Lifecycle, Location, ResolvedDependencies, Slot,
};
pub use error::{EmitError, HandlerError, RequestError, ServiceError, StreamError};
pub use events::{Emitter, EventSettings, EventsDeclaration, StreamAction, StreamOptions};
pub use kv::{KvBucketOptions, KvManager};
pub use method::{Method, MethodContext, MethodDescriptor, MethodSettings};
pub use payload::{ByteStream, Payload};
pub use service::{Service, ServiceBuilder};
pub use streams::{ListenerOptions, StreamManager};
pub use telemetry::{Telemetry, Traced};
pub use validation::{BasicValidator, SchemaValidator, ValidationError};

pub use nsc_broker as broker;
pub use nsc_proto as proto;
