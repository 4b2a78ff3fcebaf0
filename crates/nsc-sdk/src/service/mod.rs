//! Service dispatcher.
//!
//! A [`Service`] owns its broker handle, container, tracer and root-span
//! table. [`Service::start`] subscribes broker methods on
//! `<service>.<action>` (queue group = service name), serves streaming
//! methods over HTTP, provisions streams and key-value buckets, and starts
//! the probe and status watcher. [`Service::shutdown`] closes everything
//! against one shared timeout.

mod dispatch;
mod http;
mod probe;
mod shutdown;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ::http::HeaderMap;
use nsc_broker::{Broker, SubscribeOptions};
use nsc_proto::headers::REQUEST_ID;
use nsc_proto::subject::{http_settings_subject, method_subject};
use nsc_proto::{Baggage, DeadlinePolicy, HeaderSource, HttpSettings, ProtoError};
use opentelemetry::trace::SpanKind;
use opentelemetry_sdk::trace::TracerProvider;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use self::dispatch::Dispatcher;
use self::shutdown::Closer;
use crate::cache::CacheSettings;
use crate::client::{ClientParts, ServiceClient};
use crate::config::{RuntimeSettings, ServiceConfig};
use crate::container::{Container, Lifecycle};
use crate::error::{HandlerError, ServiceError};
use crate::events::{Emitter, EventsDeclaration};
use crate::kv::{KvBucketOptions, KvManager};
use crate::method::{Method, MethodDescriptor};
use crate::payload::Payload;
use crate::streams::StreamManager;
use crate::telemetry::{RootSpans, Telemetry};
use crate::validation::{BasicValidator, SchemaValidator};

/// Handles owned by a started service.
struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    http: Option<JoinHandle<()>>,
    probe: Option<JoinHandle<()>>,
    http_settings: Option<HttpSettings>,
}

/// Serving handles produced by [`Service::launch`].
struct Launched {
    tasks: Vec<JoinHandle<()>>,
    http: Option<JoinHandle<()>>,
    probe: Option<JoinHandle<()>>,
    http_settings: Option<HttpSettings>,
}

/// Exclusive right to start a service, released on drop.
struct StartClaim<'a>(&'a AtomicBool);

impl<'a> StartClaim<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for StartClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    dispatcher: Arc<Dispatcher>,
    methods: Vec<MethodDescriptor>,
    events: Arc<EventsDeclaration>,
    kv_buckets: BTreeMap<String, KvBucketOptions>,
    config: ServiceConfig,
    runtime: RuntimeSettings,
    deadline: DeadlinePolicy,
    shutdown_resources: Vec<Arc<dyn Lifecycle>>,
    process_hooks: bool,
    roots: RootSpans,
    alive: Arc<AtomicBool>,
    starting: AtomicBool,
    running: Mutex<Option<Running>>,
}

/// A service in the mesh. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

impl Service {
    pub fn builder(name: impl Into<Arc<str>>) -> ServiceBuilder {
        ServiceBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.inner.dispatcher.name
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        self.inner.dispatcher.broker()
    }

    pub fn container(&self) -> &Arc<Container> {
        &self.inner.dispatcher.container
    }

    pub fn emitter(&self) -> &Emitter {
        &self.inner.dispatcher.emitter
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.inner.dispatcher.telemetry
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Address of the streaming HTTP listener, once started.
    pub fn http_settings(&self) -> Option<HttpSettings> {
        self.inner
            .running
            .lock()
            .as_ref()
            .and_then(|r| r.http_settings.clone())
    }

    /// Starts serving. Any error here is a startup failure the process
    /// should not survive; see [`Service::run`].
    pub async fn start(&self) -> Result<(), ServiceError> {
        let Some(_claim) = StartClaim::acquire(&self.inner.starting) else {
            return Err(ServiceError::AlreadyStarted);
        };
        if self.is_running() {
            return Err(ServiceError::AlreadyStarted);
        }
        let inner = &self.inner;
        let dispatcher = &inner.dispatcher;
        let name = dispatcher.name.clone();

        inner
            .deadline
            .require_default()
            .map_err(|err| ServiceError::FatalStartup(err.to_string()))?;
        if let Some(agent) = &inner.runtime.otel_agent {
            tracing::info!(service = %name, agent = %agent, "tracing agent configured");
        }

        let cancel = CancellationToken::new();
        // Stops whatever was already spawned if startup fails part way.
        let abort_on_error = cancel.clone().drop_guard();

        match dispatcher.container.init_dependencies().await {
            Ok(initialized) if !initialized.is_empty() => {
                tracing::debug!(service = %name, count = initialized.len(), "dependencies initialised");
            }
            Ok(_) => {}
            Err(err) => {
                self.close_after_failed_start().await;
                return Err(err.into());
            }
        }

        let launched = match self.launch(&cancel).await {
            Ok(launched) => launched,
            Err(err) => {
                drop(abort_on_error);
                self.close_after_failed_start().await;
                return Err(err);
            }
        };

        if inner.process_hooks {
            shutdown::install_panic_hook();
            let service = self.clone();
            tokio::spawn(async move {
                shutdown::signal().await;
                service.stop().await;
            });
        }

        abort_on_error.disarm();
        inner.alive.store(true, Ordering::SeqCst);
        *inner.running.lock() = Some(Running {
            cancel,
            tasks: launched.tasks,
            http: launched.http,
            probe: launched.probe,
            http_settings: launched.http_settings,
        });
        tracing::info!(service = %name, methods = inner.methods.len(), "service started");
        Ok(())
    }

    /// Provisions streams and buckets, then spawns every serving task.
    async fn launch(&self, cancel: &CancellationToken) -> Result<Launched, ServiceError> {
        let inner = &self.inner;
        let dispatcher = &inner.dispatcher;
        let name = dispatcher.name.clone();
        let mut tasks = Vec::new();

        if let Some(options) = &inner.events.stream_options {
            let manager = StreamManager::new(name.as_ref(), options.clone(), dispatcher.broker().clone());
            let streams = manager.create_streams().await?;
            tracing::info!(service = %name, streams = streams.len(), "streams ready");
        }

        if !inner.kv_buckets.is_empty() {
            let buckets = KvManager::new(dispatcher.broker().clone(), inner.kv_buckets.clone())
                .create_buckets()
                .await?;
            *dispatcher.buckets.write() = buckets;
        }

        let (http_methods, broker_methods): (Vec<_>, Vec<_>) = inner
            .methods
            .iter()
            .cloned()
            .partition(|m| m.settings().uses_http());

        for method in broker_methods {
            let subject = method_subject(&name, method.action());
            let subscription = dispatcher
                .broker()
                .subscribe(&subject, SubscribeOptions::queue(name.as_ref()))
                .await?;
            let limit = inner
                .config
                .max_in_flight()
                .map(|n| Arc::new(Semaphore::new(n)));
            tracing::debug!(subject = %subject, "serving over broker");
            tasks.push(dispatch::spawn_pump(
                dispatcher.clone(),
                method,
                subscription,
                limit,
                cancel.clone(),
            ));
        }

        let mut http_task = None;
        let mut http_settings = None;
        if !http_methods.is_empty() {
            let router = http::router(dispatcher.clone(), http_methods);
            let (addr, task) = http::serve(router, inner.config.http_host, cancel.clone())
                .await
                .map_err(|err| ServiceError::FatalStartup(format!("cannot bind HTTP listener: {err}")))?;
            let ip = http::advertised_ip(inner.config.http_host, inner.config.advertise_ip).await;
            let settings = HttpSettings {
                ip: ip.to_string(),
                port: addr.port(),
            };
            let subscription = dispatcher
                .broker()
                .subscribe(&http_settings_subject(&name), SubscribeOptions::queue(name.as_ref()))
                .await?;
            tasks.push(dispatch::spawn_settings_responder(
                subscription,
                settings.clone(),
                cancel.clone(),
            ));
            tracing::info!(service = %name, addr = %settings.base_url(), "serving over HTTP");
            http_task = Some(task);
            http_settings = Some(settings);
        }

        tasks.push(probe::watch_status(dispatcher.broker(), name.clone(), cancel.clone()));

        let probe_task = if inner.runtime.is_local() {
            tracing::debug!(service = %name, "local environment, probe disabled");
            None
        } else {
            probe::start(
                inner.config.probe_port,
                inner.alive.clone(),
                dispatcher.broker().kind(),
                cancel.clone(),
            )
            .await?
        };

        Ok(Launched {
            tasks,
            http: http_task,
            probe: probe_task,
            http_settings,
        })
    }

    async fn close_after_failed_start(&self) {
        let abandoned =
            shutdown::close_all(self.dependency_closers(), self.inner.config.graceful_shutdown_timeout())
                .await;
        if !abandoned.is_empty() {
            tracing::warn!(service = %self.inner.dispatcher.name, ?abandoned, "dependencies not closed after failed start");
        }
    }

    /// Drains the broker and closes the HTTP listener, every shutdown
    /// resource and the probe, each raced against the configured timeout.
    ///
    /// Returns the names of resources abandoned because they ran out of time.
    pub async fn shutdown(&self) -> Vec<String> {
        let Some(running) = self.inner.running.lock().take() else {
            return Vec::new();
        };
        let inner = &self.inner;
        inner.alive.store(false, Ordering::SeqCst);
        running.cancel.cancel();

        let mut closers = Vec::new();
        let broker = inner.dispatcher.broker().clone();
        closers.push(Closer::new("broker", async move {
            broker.drain().await.map_err(|err| err.to_string())
        }));
        if let Some(task) = running.http {
            closers.push(Closer::new("http", async move {
                task.await.map_err(|err| err.to_string())
            }));
        }
        closers.extend(self.dependency_closers());
        for (index, resource) in inner.shutdown_resources.iter().enumerate() {
            let resource = resource.clone();
            closers.push(Closer::new(format!("resource-{index}"), async move {
                resource.close().await.map_err(|err| err.to_string())
            }));
        }
        if let Some(task) = running.probe {
            closers.push(Closer::new("probe", async move {
                task.await.map_err(|err| err.to_string())
            }));
        }

        let abandoned = shutdown::close_all(closers, inner.config.graceful_shutdown_timeout()).await;
        for task in running.tasks {
            task.abort();
        }
        inner.roots.end_all();
        inner.dispatcher.telemetry.flush();
        tracing::info!(service = %inner.dispatcher.name, "service stopped");
        abandoned
    }

    /// Closers for the container's initialised lifecycles. Ones unbound
    /// since start were closed by `unbind` and are not included.
    fn dependency_closers(&self) -> Vec<Closer> {
        self.inner
            .dispatcher
            .container
            .take_initialized()
            .into_iter()
            .map(|(key, lifecycle)| {
                Closer::new(format!("dependency-{key}"), async move {
                    lifecycle.close().await.map_err(|err| err.to_string())
                })
            })
            .collect()
    }

    /// Shuts down and exits the process with status 0.
    pub async fn stop(&self) {
        self.shutdown().await;
        std::process::exit(0);
    }

    /// Starts the service and serves until a termination signal.
    ///
    /// A startup failure is logged and exits the process with status 1.
    pub async fn run(self) {
        if let Err(err) = self.start().await {
            tracing::error!(service = %self.name(), error = %err, "startup failed");
            std::process::exit(1);
        }
        if self.inner.process_hooks {
            std::future::pending::<()>().await;
        }
        shutdown::signal().await;
        self.stop().await;
    }

    /// Baggage for a request entering the mesh at this service.
    ///
    /// Starts a root span for `subject`, continuing any trace found in
    /// `headers`. The deadline comes from `own_timeout`, an inherited header
    /// deadline or the default timeout. End the span with
    /// [`Service::end_root_span`].
    pub fn root_baggage(
        &self,
        subject: &str,
        headers: Option<&HeaderMap>,
        own_timeout: Option<Duration>,
    ) -> Result<Baggage, ProtoError> {
        let parent = headers.and_then(|h| Baggage::from_headers(h));
        let inherited = parent.as_ref().and_then(|b| b.expired);
        let expired = self.inner.deadline.deadline(inherited, own_timeout)?;

        let span = self
            .inner
            .dispatcher
            .telemetry
            .start_span(subject.to_string(), SpanKind::Consumer, parent.as_ref());
        let mut baggage = span.baggage().with_expired(expired);
        let request_id = parent
            .and_then(|b| b.request_id)
            .or_else(|| headers.and_then(|h| h.header(REQUEST_ID)).map(str::to_string));
        if let Some(id) = request_id {
            baggage = baggage.with_request_id(id);
        }
        self.inner.roots.insert(span);
        Ok(baggage)
    }

    /// Ends the root span of `trace_id`, marking it failed when `error` is set.
    pub fn end_root_span(&self, trace_id: &str, error: Option<&str>) -> bool {
        self.inner.roots.end(trace_id, error)
    }

    pub fn open_root_spans(&self) -> usize {
        self.inner.roots.len()
    }

    /// A typed client sharing this service's broker, tracer and cache.
    pub fn build_client<C: ServiceClient>(&self, baggage: Option<Baggage>) -> C {
        C::from_parts(self.client_parts(baggage))
    }

    pub fn client_parts(&self, baggage: Option<Baggage>) -> ClientParts {
        self.inner.dispatcher.client_parts(baggage)
    }

    /// Runs `action` in-process, as if it had arrived over the broker.
    pub async fn handle(
        &self,
        action: &str,
        request: Payload,
        baggage: Option<Baggage>,
    ) -> Result<Payload, HandlerError> {
        let method = self
            .inner
            .methods
            .iter()
            .find(|m| m.action() == action)
            .ok_or_else(|| HandlerError::new(format!("unknown action {action}")))?;
        self.inner.dispatcher.handled(method, request, baggage).await
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.inner.dispatcher.name)
            .field("methods", &self.inner.methods.len())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Builder for [`Service`].
#[must_use]
pub struct ServiceBuilder {
    name: Arc<str>,
    broker: Option<Arc<dyn Broker>>,
    methods: Vec<MethodDescriptor>,
    events: EventsDeclaration,
    kv_buckets: BTreeMap<String, KvBucketOptions>,
    container: Option<Arc<Container>>,
    cache: Option<CacheSettings>,
    validator: Option<Arc<dyn SchemaValidator>>,
    config: Option<ServiceConfig>,
    runtime: Option<RuntimeSettings>,
    default_timeout: Option<Duration>,
    tracer_provider: Option<TracerProvider>,
    shutdown_resources: Vec<Arc<dyn Lifecycle>>,
    process_hooks: bool,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            broker: None,
            methods: Vec::new(),
            events: EventsDeclaration::default(),
            kv_buckets: BTreeMap::new(),
            container: None,
            cache: None,
            validator: None,
            config: None,
            runtime: None,
            default_timeout: None,
            tracer_provider: None,
            shutdown_resources: Vec::new(),
            process_hooks: false,
        }
    }

    /// Uses an existing broker instead of connecting from the configuration.
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn method<M: Method>(mut self) -> Self {
        self.methods.push(MethodDescriptor::of::<M>());
        self
    }

    pub fn method_descriptor(mut self, descriptor: MethodDescriptor) -> Self {
        self.methods.push(descriptor);
        self
    }

    pub fn events(mut self, events: EventsDeclaration) -> Self {
        self.events = events;
        self
    }

    pub fn kv_bucket(mut self, name: impl Into<String>, options: KvBucketOptions) -> Self {
        self.kv_buckets.insert(name.into(), options);
        self
    }

    pub fn container(mut self, container: Arc<Container>) -> Self {
        self.container = Some(container);
        self
    }

    /// Response cache for this service's clients. The lookup timeout is
    /// taken from [`ServiceConfig::cache_timeout_ms`].
    pub fn cache(mut self, cache: CacheSettings) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Loads [`ServiceConfig`] from a TOML file plus `NSC_` overrides.
    pub fn config_file(self, path: impl AsRef<Path>) -> Result<Self, ServiceError> {
        let config = ServiceConfig::load_from(path)?;
        Ok(self.config(config))
    }

    /// Environment settings; read from the process environment when unset.
    pub fn runtime(mut self, runtime: RuntimeSettings) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Overrides `DEFAULT_RESPONSE_TIMEOUT`.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn tracer_provider(mut self, provider: TracerProvider) -> Self {
        self.tracer_provider = Some(provider);
        self
    }

    /// Extra resource closed at shutdown.
    pub fn shutdown_resource(mut self, resource: Arc<dyn Lifecycle>) -> Self {
        self.shutdown_resources.push(resource);
        self
    }

    /// Installs signal handlers and the fail-fast panic hook at start.
    pub fn process_hooks(mut self, enabled: bool) -> Self {
        self.process_hooks = enabled;
        self
    }

    pub async fn build(self) -> Result<Service, ServiceError> {
        let mut seen = HashSet::new();
        for method in &self.methods {
            if !seen.insert(method.action().to_string()) {
                return Err(ServiceError::DuplicateMethod(method.action().to_string()));
            }
        }

        let config = self.config.unwrap_or_default();
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => RuntimeSettings::from_env()?,
        };
        let deadline = match self.default_timeout {
            Some(timeout) => DeadlinePolicy::new(timeout),
            None => runtime.deadline_policy(),
        };
        let broker = match self.broker {
            Some(broker) => broker,
            None => nsc_broker::connect(&config.broker).await?,
        };

        let telemetry = match self.tracer_provider {
            Some(provider) => Telemetry::with_provider(provider, self.name.to_string()),
            None => Telemetry::new(self.name.to_string()),
        };
        let cache = self
            .cache
            .map(|cache| cache.with_timeout(config.cache_timeout()));
        let events = Arc::new(self.events);
        let emitter = Emitter::new(self.name.clone(), events.clone(), broker.clone());

        let parts = ClientParts {
            broker,
            baggage: None,
            cache,
            telemetry: telemetry.clone(),
            deadline,
            validator: self
                .validator
                .unwrap_or_else(|| Arc::new(BasicValidator::new())),
            http: reqwest::Client::new(),
            caller: Some(self.name.clone()),
        };

        let dispatcher = Arc::new(Dispatcher {
            name: self.name,
            container: self.container.unwrap_or_default(),
            telemetry,
            emitter,
            parts,
            buckets: RwLock::new(HashMap::new()),
        });

        Ok(Service {
            inner: Arc::new(Inner {
                dispatcher,
                methods: self.methods,
                events,
                kv_buckets: self.kv_buckets,
                config,
                runtime,
                deadline,
                shutdown_resources: self.shutdown_resources,
                process_hooks: self.process_hooks,
                roots: RootSpans::default(),
                alive: Arc::new(AtomicBool::new(false)),
                starting: AtomicBool::new(false),
                running: Mutex::new(None),
            }),
        })
    }
}
