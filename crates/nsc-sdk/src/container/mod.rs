//! Dependency container.
//!
//! Bindings map a [`DependencyKey`] to one of three kinds:
//!
//! - service: a client for another service, built per request with the
//!   request's baggage
//! - adapter: a value built by a factory, optionally cached as a singleton
//!   and optionally carrying an [`init`/`close`](Lifecycle) lifecycle
//! - constant: a shared value
//!
//! Adapters may declare their own dependencies, which are resolved one level
//! deep when the adapter is built.

mod resolved;

use std::any::{type_name, Any};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::client::{ClientParts, ServiceClient};

pub use resolved::{DependencyRequest, DependencySource, ResolvedDependencies, ResolvedDependency, Slot};

pub type AnyArc = Arc<dyn Any + Send + Sync>;
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Opaque binding key, compared by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependencyKey(&'static str);

impl DependencyKey {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for DependencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("dependency not bound: {0}")]
    NotBound(DependencyKey),

    #[error("service dependency {0} cannot be instantiated from the container")]
    ServiceNotInstantiable(DependencyKey),

    #[error("dependency {key} is not a {expected}")]
    TypeMismatch {
        key: String,
        expected: &'static str,
    },

    #[error("missing constructor argument {0}")]
    MissingArgument(Slot),

    #[error("failed to build {key}: {reason}")]
    Construction { key: DependencyKey, reason: String },

    #[error("lifecycle of {key} failed: {reason}")]
    Lifecycle { key: DependencyKey, reason: String },
}

/// Startup and shutdown hooks for adapters holding external resources.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn init(&self) -> Result<(), BoxError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), BoxError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Location {
    #[default]
    Internal,
    External,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterOptions {
    /// Cache the first instance and reuse it.
    pub singleton: bool,
    /// Call [`Lifecycle::init`] at service start. Implies singleton.
    pub init: bool,
    pub location: Location,
}

impl AdapterOptions {
    fn cached(&self) -> bool {
        self.singleton || self.init
    }
}

#[derive(Clone)]
pub struct AdapterInstance {
    value: AnyArc,
    lifecycle: Option<Arc<dyn Lifecycle>>,
}

impl AdapterInstance {
    pub fn value(&self) -> &AnyArc {
        &self.value
    }

    pub fn lifecycle(&self) -> Option<&Arc<dyn Lifecycle>> {
        self.lifecycle.as_ref()
    }
}

/// Resolved constructor arguments for an adapter factory.
#[derive(Default, Clone)]
pub struct ConstructorArgs {
    values: HashMap<Slot, AnyArc>,
}

impl ConstructorArgs {
    pub fn get<T: Any + Send + Sync>(&self, slot: impl Into<Slot>) -> Result<Arc<T>, ContainerError> {
        let slot = slot.into();
        let value = self
            .values
            .get(&slot)
            .cloned()
            .ok_or(ContainerError::MissingArgument(slot))?;
        value.downcast::<T>().map_err(|_| ContainerError::TypeMismatch {
            key: slot.to_string(),
            expected: type_name::<T>(),
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

type AdapterFactory =
    Arc<dyn Fn(&ConstructorArgs) -> Result<AdapterInstance, BoxError> + Send + Sync>;
pub(crate) type ServiceFactory = Arc<dyn Fn(ClientParts) -> AnyArc + Send + Sync>;

/// A binding.
#[derive(Clone)]
pub enum Dependency {
    Service(ServiceFactory),
    Adapter {
        factory: AdapterFactory,
        dependencies: Vec<DependencyRequest>,
        options: AdapterOptions,
    },
    Constant(AnyArc),
}

impl Dependency {
    pub fn constant<T: Any + Send + Sync>(value: T) -> Self {
        Self::Constant(Arc::new(value))
    }

    /// A typed client for another service.
    pub fn service<C: ServiceClient>() -> Self {
        Self::Service(Arc::new(|parts: ClientParts| Arc::new(C::from_parts(parts)) as AnyArc))
    }

    pub fn adapter<T, E, F>(factory: F) -> Self
    where
        T: Any + Send + Sync,
        E: Into<BoxError>,
        F: Fn(&ConstructorArgs) -> Result<T, E> + Send + Sync + 'static,
    {
        Self::Adapter {
            factory: Arc::new(move |args: &ConstructorArgs| -> Result<AdapterInstance, BoxError> {
                let value: AnyArc = Arc::new(factory(args).map_err(Into::<BoxError>::into)?);
                Ok(AdapterInstance {
                    value,
                    lifecycle: None,
                })
            }),
            dependencies: Vec::new(),
            options: AdapterOptions::default(),
        }
    }

    /// An adapter whose `init` runs at service start and whose `close` runs at shutdown.
    pub fn lifecycle_adapter<T, E, F>(factory: F) -> Self
    where
        T: Lifecycle + Any,
        E: Into<BoxError>,
        F: Fn(&ConstructorArgs) -> Result<T, E> + Send + Sync + 'static,
    {
        Self::Adapter {
            factory: Arc::new(move |args: &ConstructorArgs| -> Result<AdapterInstance, BoxError> {
                let instance = Arc::new(factory(args).map_err(Into::<BoxError>::into)?);
                Ok(AdapterInstance {
                    value: instance.clone(),
                    lifecycle: Some(instance),
                })
            }),
            dependencies: Vec::new(),
            options: AdapterOptions {
                singleton: true,
                init: true,
                location: Location::Internal,
            },
        }
    }

    /// Declares the adapter's own constructor dependencies.
    pub fn with_dependencies(mut self, requests: Vec<DependencyRequest>) -> Self {
        if let Self::Adapter { dependencies, .. } = &mut self {
            *dependencies = requests;
        }
        self
    }

    pub fn singleton(mut self) -> Self {
        if let Self::Adapter { options, .. } = &mut self {
            options.singleton = true;
        }
        self
    }

    /// Calls to an external adapter are traced as client spans.
    pub fn external(mut self) -> Self {
        if let Self::Adapter { options, .. } = &mut self {
            options.location = Location::External;
        }
        self
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Service(_) => "service",
            Self::Adapter { .. } => "adapter",
            Self::Constant(_) => "constant",
        }
    }

    pub fn adapter_options(&self) -> Option<AdapterOptions> {
        match self {
            Self::Adapter { options, .. } => Some(*options),
            _ => None,
        }
    }
}

impl fmt::Debug for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Adapter {
                dependencies,
                options,
                ..
            } => f
                .debug_struct("Adapter")
                .field("dependencies", &dependencies.len())
                .field("options", options)
                .finish(),
            other => f.write_str(other.kind()),
        }
    }
}

/// A binding together with its constructor arguments.
#[derive(Clone)]
pub struct Resolved {
    pub dependency: Dependency,
    pub args: ConstructorArgs,
}

#[derive(Default)]
pub struct Container {
    bindings: RwLock<HashMap<DependencyKey, Dependency>>,
    singletons: Mutex<HashMap<DependencyKey, AdapterInstance>>,
    initialized: Mutex<HashSet<DependencyKey>>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `key`, replacing any earlier binding and its cached instance.
    pub fn bind(&self, key: DependencyKey, dependency: Dependency) -> &Self {
        tracing::debug!(key = %key, kind = dependency.kind(), "binding dependency");
        self.bindings.write().insert(key, dependency);
        self.singletons.lock().remove(&key);
        self.initialized.lock().remove(&key);
        self
    }

    pub fn contains(&self, key: DependencyKey) -> bool {
        self.bindings.read().contains_key(&key)
    }

    /// Removes a binding, closing its cached singleton first.
    ///
    /// When `close` fails the binding and instance are kept and the error is returned.
    pub async fn unbind(&self, key: DependencyKey) -> Result<(), ContainerError> {
        if !self.contains(key) {
            return Err(ContainerError::NotBound(key));
        }
        let cached = self.singletons.lock().get(&key).cloned();
        if let Some(lifecycle) = cached.as_ref().and_then(|i| i.lifecycle.clone()) {
            lifecycle
                .close()
                .await
                .map_err(|err| ContainerError::Lifecycle {
                    key,
                    reason: err.to_string(),
                })?;
        }
        self.bindings.write().remove(&key);
        self.singletons.lock().remove(&key);
        self.initialized.lock().remove(&key);
        Ok(())
    }

    /// The binding for `key` with its adapter dependencies resolved.
    pub fn get(&self, key: DependencyKey) -> Result<Resolved, ContainerError> {
        let dependency = self.binding(key)?;
        let mut args = ConstructorArgs::default();
        if let Dependency::Adapter { dependencies, .. } = &dependency {
            for request in dependencies {
                let DependencySource::Key(dep_key) = request.source else {
                    continue;
                };
                args.values.insert(request.slot, self.nested(dep_key)?);
            }
        }
        Ok(Resolved { dependency, args })
    }

    /// An instance of an adapter or constant binding.
    pub fn get_instance(&self, key: DependencyKey) -> Result<AnyArc, ContainerError> {
        match self.binding(key)? {
            Dependency::Constant(value) => Ok(value),
            Dependency::Service(_) => Err(ContainerError::ServiceNotInstantiable(key)),
            Dependency::Adapter { .. } => Ok(self.adapter_instance(key)?.value),
        }
    }

    pub fn get_instance_as<T: Any + Send + Sync>(
        &self,
        key: DependencyKey,
    ) -> Result<Arc<T>, ContainerError> {
        self.get_instance(key)?
            .downcast::<T>()
            .map_err(|_| ContainerError::TypeMismatch {
                key: key.to_string(),
                expected: type_name::<T>(),
            })
    }

    /// Runs `init` on every adapter bound with `init` that has not been initialised yet.
    ///
    /// Returns the newly initialised lifecycles so the caller can close them at shutdown.
    pub async fn init_dependencies(&self) -> Result<Vec<Arc<dyn Lifecycle>>, ContainerError> {
        let mut pending: Vec<DependencyKey> = self
            .bindings
            .read()
            .iter()
            .filter(|(_, dep)| dep.adapter_options().is_some_and(|o| o.init))
            .map(|(key, _)| *key)
            .collect();
        pending.sort();

        let mut started = Vec::new();
        for key in pending {
            if self.initialized.lock().contains(&key) {
                continue;
            }
            let instance = self.adapter_instance(key)?;
            if let Some(lifecycle) = instance.lifecycle {
                lifecycle
                    .init()
                    .await
                    .map_err(|err| ContainerError::Lifecycle {
                        key,
                        reason: err.to_string(),
                    })?;
                tracing::info!(key = %key, "initialised dependency");
                started.push(lifecycle);
            }
            self.initialized.lock().insert(key);
        }
        Ok(started)
    }

    /// Hands back every initialised lifecycle still bound, forgetting it.
    ///
    /// The caller closes them. A later [`Container::init_dependencies`]
    /// builds and initialises fresh instances.
    pub fn take_initialized(&self) -> Vec<(DependencyKey, Arc<dyn Lifecycle>)> {
        let mut keys: Vec<DependencyKey> = self.initialized.lock().drain().collect();
        keys.sort();
        let mut singletons = self.singletons.lock();
        keys.into_iter()
            .filter_map(|key| {
                let instance = singletons.remove(&key)?;
                instance.lifecycle.map(|lifecycle| (key, lifecycle))
            })
            .collect()
    }

    fn binding(&self, key: DependencyKey) -> Result<Dependency, ContainerError> {
        self.bindings
            .read()
            .get(&key)
            .cloned()
            .ok_or(ContainerError::NotBound(key))
    }

    fn adapter_instance(&self, key: DependencyKey) -> Result<AdapterInstance, ContainerError> {
        if let Some(instance) = self.singletons.lock().get(&key) {
            return Ok(instance.clone());
        }
        let Resolved { dependency, args } = self.get(key)?;
        let Dependency::Adapter {
            factory, options, ..
        } = dependency
        else {
            return Err(ContainerError::TypeMismatch {
                key: key.to_string(),
                expected: "adapter",
            });
        };
        let instance = factory(&args).map_err(|err| ContainerError::Construction {
            key,
            reason: err.to_string(),
        })?;
        if !options.cached() {
            return Ok(instance);
        }
        Ok(self
            .singletons
            .lock()
            .entry(key)
            .or_insert(instance)
            .clone())
    }

    /// One-level resolution for adapter constructor arguments.
    fn nested(&self, key: DependencyKey) -> Result<AnyArc, ContainerError> {
        match self.binding(key)? {
            Dependency::Constant(value) => Ok(value),
            Dependency::Service(_) => Err(ContainerError::ServiceNotInstantiable(key)),
            Dependency::Adapter {
                factory, options, ..
            } => {
                if let Some(instance) = self.singletons.lock().get(&key) {
                    return Ok(instance.value.clone());
                }
                let instance = factory(&ConstructorArgs::default()).map_err(|err| {
                    ContainerError::Construction {
                        key,
                        reason: err.to_string(),
                    }
                })?;
                if options.cached() {
                    let mut singletons = self.singletons.lock();
                    return Ok(singletons.entry(key).or_insert(instance).value.clone());
                }
                Ok(instance.value)
            }
        }
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("bindings", &self.bindings.read().len())
            .field("singletons", &self.singletons.lock().len())
            .finish()
    }
}
