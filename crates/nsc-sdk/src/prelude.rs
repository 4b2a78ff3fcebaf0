//! Common imports for writing services.
//!
//! ```no_run
//! use nsc_sdk::prelude::*;
//! # fn main() {}
//! ```

pub use crate::client::{Client, ClientParts, EventDelivery, ServiceClient};
pub use crate::container::{
    ConstructorArgs, Container, Dependency, DependencyKey, DependencyRequest, Lifecycle,
    ResolvedDependencies,
};
pub use crate::error::{HandlerError, RequestError, ServiceError};
pub use crate::events::{EventSettings, EventsDeclaration};
pub use crate::method::{Method, MethodContext, MethodSettings};
pub use crate::payload::Payload;
pub use crate::service::Service;
pub use crate::streams::ListenerOptions;

pub use async_trait::async_trait;
pub use nsc_broker::{Broker, MemoryBroker};
pub use nsc_proto::Baggage;
pub use serde::{Deserialize, Serialize};
