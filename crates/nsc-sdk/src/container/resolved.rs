use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use nsc_broker::KvBucket;
use opentelemetry::trace::SpanKind;
use opentelemetry::Context;

use super::{AnyArc, ContainerError, DependencyKey, Location};
use crate::telemetry::{Telemetry, Traced};

/// Where an injected dependency lands: a constructor position or a named property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    Position(usize),
    Named(&'static str),
}

impl From<usize> for Slot {
    fn from(index: usize) -> Self {
        Self::Position(index)
    }
}

impl From<&'static str> for Slot {
    fn from(name: &'static str) -> Self {
        Self::Named(name)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Position(index) => write!(f, "#{index}"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencySource {
    Key(DependencyKey),
    /// A key-value bucket declared by the service.
    Bucket(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyRequest {
    pub slot: Slot,
    pub source: DependencySource,
}

impl DependencyRequest {
    pub fn positional(index: usize, key: DependencyKey) -> Self {
        Self {
            slot: Slot::Position(index),
            source: DependencySource::Key(key),
        }
    }

    pub fn named(name: &'static str, key: DependencyKey) -> Self {
        Self {
            slot: Slot::Named(name),
            source: DependencySource::Key(key),
        }
    }

    pub fn bucket(slot: impl Into<Slot>, bucket: &'static str) -> Self {
        Self {
            slot: slot.into(),
            source: DependencySource::Bucket(bucket),
        }
    }
}

#[derive(Clone)]
pub enum ResolvedDependency {
    Service(AnyArc),
    Adapter { value: AnyArc, location: Location },
    Constant(AnyArc),
    Bucket(Arc<dyn KvBucket>),
}

impl ResolvedDependency {
    fn kind(&self) -> &'static str {
        match self {
            Self::Service(_) => "service",
            Self::Adapter { .. } => "adapter",
            Self::Constant(_) => "constant",
            Self::Bucket(_) => "bucket",
        }
    }
}

/// Dependencies injected into one method instance.
///
/// Adapters come back wrapped in [`Traced`] so their calls appear as
/// children of the request span.
pub struct ResolvedDependencies {
    entries: HashMap<Slot, ResolvedDependency>,
    telemetry: Telemetry,
    parent: Context,
}

impl ResolvedDependencies {
    pub fn new(telemetry: Telemetry, parent: Context) -> Self {
        Self {
            entries: HashMap::new(),
            telemetry,
            parent,
        }
    }

    pub fn insert(&mut self, slot: Slot, dependency: ResolvedDependency) {
        self.entries.insert(slot, dependency);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A service client bound with [`Dependency::service`](super::Dependency::service).
    pub fn service<C: Any + Send + Sync>(&self, slot: impl Into<Slot>) -> Result<Arc<C>, ContainerError> {
        let slot = slot.into();
        match self.entry(slot)? {
            ResolvedDependency::Service(value) => downcast(slot, value.clone()),
            other => Err(mismatch::<C>(slot, other)),
        }
    }

    pub fn adapter<T: Any + Send + Sync>(&self, slot: impl Into<Slot>) -> Result<Traced<T>, ContainerError> {
        let slot = slot.into();
        match self.entry(slot)? {
            ResolvedDependency::Adapter { value, location } => {
                let kind = match location {
                    Location::External => SpanKind::Client,
                    Location::Internal => SpanKind::Internal,
                };
                Ok(Traced::new(
                    downcast(slot, value.clone())?,
                    self.telemetry.clone(),
                    self.parent.clone(),
                    kind,
                ))
            }
            other => Err(mismatch::<T>(slot, other)),
        }
    }

    pub fn constant<T: Any + Send + Sync>(&self, slot: impl Into<Slot>) -> Result<Arc<T>, ContainerError> {
        let slot = slot.into();
        match self.entry(slot)? {
            ResolvedDependency::Constant(value) => downcast(slot, value.clone()),
            other => Err(mismatch::<T>(slot, other)),
        }
    }

    pub fn bucket(&self, slot: impl Into<Slot>) -> Result<Arc<dyn KvBucket>, ContainerError> {
        let slot = slot.into();
        match self.entry(slot)? {
            ResolvedDependency::Bucket(bucket) => Ok(bucket.clone()),
            other => Err(ContainerError::TypeMismatch {
                key: format!("{slot} ({})", other.kind()),
                expected: "bucket",
            }),
        }
    }

    fn entry(&self, slot: Slot) -> Result<&ResolvedDependency, ContainerError> {
        self.entries
            .get(&slot)
            .ok_or(ContainerError::MissingArgument(slot))
    }
}

fn downcast<T: Any + Send + Sync>(slot: Slot, value: AnyArc) -> Result<Arc<T>, ContainerError> {
    value
        .downcast::<T>()
        .map_err(|_| ContainerError::TypeMismatch {
            key: slot.to_string(),
            expected: type_name::<T>(),
        })
}

fn mismatch<T>(slot: Slot, found: &ResolvedDependency) -> ContainerError {
    ContainerError::TypeMismatch {
        key: format!("{slot} ({})", found.kind()),
        expected: type_name::<T>(),
    }
}
