//! Test fixtures: the Math service, its adapters and a Gateway that calls it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{stream, StreamExt};
use nsc_sdk::container::BoxError;
use nsc_sdk::prelude::*;
use nsc_sdk::{KvBucketOptions, ServiceBuilder, StreamAction, StreamOptions, Traced};
use serde_json::{json, Value};

pub const REPOSITORY: DependencyKey = DependencyKey::new("repository");
pub const INSTANCE: DependencyKey = DependencyKey::new("instance");
pub const GAUGE: DependencyKey = DependencyKey::new("gauge");
pub const MATH: DependencyKey = DependencyKey::new("math");
pub const POOL: DependencyKey = DependencyKey::new("pool");

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SumRequest {
    pub a: i64,
    pub b: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SumResponse {
    pub result: i64,
}

pub fn sum_settings() -> MethodSettings {
    MethodSettings::new("Sum")
        .with_request_schema(json!({
            "type": "object",
            "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
            "required": ["a", "b"],
            "additionalProperties": false
        }))
        .with_response_schema(json!({
            "type": "object",
            "properties": {"result": {"type": "number"}},
            "required": ["result"]
        }))
        .validated(true, true)
}

/// Adds two numbers.
pub struct Sum;

#[async_trait]
impl Method for Sum {
    fn settings() -> MethodSettings {
        sum_settings()
    }

    fn build(_: ResolvedDependencies, _: MethodContext) -> Result<Self, HandlerError> {
        Ok(Sum)
    }

    async fn handle(&mut self, request: Payload) -> Result<Payload, HandlerError> {
        let SumRequest { a, b } = request.decode()?;
        Ok(Payload::json(&SumResponse { result: a + b })?)
    }
}

/// Sums a stream of integer records.
pub struct SumStream;

#[async_trait]
impl Method for SumStream {
    fn settings() -> MethodSettings {
        MethodSettings::new("SumStream").streaming(true, false)
    }

    fn build(_: ResolvedDependencies, _: MethodContext) -> Result<Self, HandlerError> {
        Ok(SumStream)
    }

    async fn handle(&mut self, request: Payload) -> Result<Payload, HandlerError> {
        let mut records = request.into_records();
        let mut result = 0;
        while let Some(record) = records.next().await {
            result += record?
                .as_i64()
                .ok_or_else(|| HandlerError::new("records must be integers"))?;
        }
        Ok(Payload::json(&SumResponse { result })?)
    }
}

#[derive(Debug, Deserialize)]
struct FibonacciRequest {
    length: usize,
}

/// Streams the first `length` Fibonacci numbers.
pub struct Fibonacci;

#[async_trait]
impl Method for Fibonacci {
    fn settings() -> MethodSettings {
        MethodSettings::new("Fibonacci").streaming(false, true)
    }

    fn build(_: ResolvedDependencies, _: MethodContext) -> Result<Self, HandlerError> {
        Ok(Fibonacci)
    }

    async fn handle(&mut self, request: Payload) -> Result<Payload, HandlerError> {
        let FibonacciRequest { length } = request.decode()?;
        let mut sequence = Vec::with_capacity(length);
        let (mut current, mut next) = (1_u64, 1_u64);
        for _ in 0..length {
            sequence.push(current);
            (current, next) = (next, current + next);
        }
        Ok(Payload::records(stream::iter(sequence)))
    }
}

#[derive(Debug, Deserialize)]
struct TicksRequest {
    count: u64,
    interval_ms: u64,
}

/// Streams `0..count`, one record every `interval_ms`.
pub struct Ticks;

#[async_trait]
impl Method for Ticks {
    fn settings() -> MethodSettings {
        MethodSettings::new("Ticks").streaming(false, true)
    }

    fn build(_: ResolvedDependencies, _: MethodContext) -> Result<Self, HandlerError> {
        Ok(Ticks)
    }

    async fn handle(&mut self, request: Payload) -> Result<Payload, HandlerError> {
        let TicksRequest { count, interval_ms } = request.decode()?;
        let interval = Duration::from_millis(interval_ms);
        let ticks = stream::iter(0..count).then(move |n| async move {
            tokio::time::sleep(interval).await;
            n
        });
        Ok(Payload::records(ticks))
    }
}

/// Always fails with code 22.
pub struct Fail;

#[async_trait]
impl Method for Fail {
    fn settings() -> MethodSettings {
        MethodSettings::new("Fail")
    }

    fn build(_: ResolvedDependencies, _: MethodContext) -> Result<Self, HandlerError> {
        Ok(Fail)
    }

    async fn handle(&mut self, _: Payload) -> Result<Payload, HandlerError> {
        Err(HandlerError::new("division by zero").with_code(22))
    }
}

pub struct Explode;

#[async_trait]
impl Method for Explode {
    fn settings() -> MethodSettings {
        MethodSettings::new("Explode")
    }

    fn build(_: ResolvedDependencies, _: MethodContext) -> Result<Self, HandlerError> {
        Ok(Explode)
    }

    async fn handle(&mut self, _: Payload) -> Result<Payload, HandlerError> {
        panic!("exploded");
    }
}

/// In-memory user store; every construction gets a new id.
pub struct Repository {
    pub id: usize,
    users: HashMap<u64, String>,
}

static REPOSITORIES: AtomicUsize = AtomicUsize::new(0);

impl Repository {
    pub fn new() -> Self {
        let users = [(1, "ada".to_string()), (2, "grace".to_string())]
            .into_iter()
            .collect();
        Self {
            id: REPOSITORIES.fetch_add(1, Ordering::SeqCst),
            users,
        }
    }

    pub fn find(&self, id: u64) -> Option<String> {
        self.users.get(&id).cloned()
    }
}

impl Default for Repository {
    fn default() -> Self {
        Self::new()
    }
}

/// Looks a user up through the repository adapter.
pub struct Lookup {
    repository: Traced<Repository>,
}

#[async_trait]
impl Method for Lookup {
    fn settings() -> MethodSettings {
        MethodSettings::new("Lookup")
    }

    fn dependencies() -> Vec<DependencyRequest> {
        vec![DependencyRequest::positional(0, REPOSITORY)]
    }

    fn build(deps: ResolvedDependencies, _: MethodContext) -> Result<Self, HandlerError> {
        Ok(Self {
            repository: deps.adapter::<Repository>(0_usize)?,
        })
    }

    async fn handle(&mut self, request: Payload) -> Result<Payload, HandlerError> {
        #[derive(Deserialize)]
        struct LookupRequest {
            id: u64,
        }

        let LookupRequest { id } = request.decode()?;
        let name = self.repository.call_sync("find", |repo| repo.find(id));
        Ok(Payload::json(&json!({
            "name": name,
            "repository": self.repository.inner().id,
        }))?)
    }
}

/// Stores a value in the `sessions` bucket.
pub struct Remember {
    sessions: Arc<dyn nsc_sdk::broker::KvBucket>,
}

#[async_trait]
impl Method for Remember {
    fn settings() -> MethodSettings {
        MethodSettings::new("Remember")
    }

    fn dependencies() -> Vec<DependencyRequest> {
        vec![DependencyRequest::bucket("sessions", "sessions")]
    }

    fn build(deps: ResolvedDependencies, _: MethodContext) -> Result<Self, HandlerError> {
        Ok(Self {
            sessions: deps.bucket("sessions")?,
        })
    }

    async fn handle(&mut self, request: Payload) -> Result<Payload, HandlerError> {
        #[derive(Deserialize)]
        struct RememberRequest {
            key: String,
            value: String,
        }

        let RememberRequest { key, value } = request.decode()?;
        let revision = self.sessions.put(&key, Bytes::from(value)).await?;
        Ok(Payload::json(&json!({ "revision": revision }))?)
    }
}

/// Publishes the event named in the request.
pub struct Notify {
    ctx: MethodContext,
}

#[async_trait]
impl Method for Notify {
    fn settings() -> MethodSettings {
        MethodSettings::new("Notify")
    }

    fn build(_: ResolvedDependencies, ctx: MethodContext) -> Result<Self, HandlerError> {
        Ok(Self { ctx })
    }

    async fn handle(&mut self, request: Payload) -> Result<Payload, HandlerError> {
        #[derive(Deserialize)]
        struct NotifyRequest {
            event: String,
            data: Value,
        }

        let NotifyRequest { event, data } = request.decode()?;
        self.ctx.emitter().emit(&event, &data).await?;
        Ok(Payload::Json(Value::Null))
    }
}

/// Answers with the name of the instance that handled the call.
pub struct WhoAmI {
    instance: Arc<String>,
}

#[async_trait]
impl Method for WhoAmI {
    fn settings() -> MethodSettings {
        MethodSettings::new("WhoAmI")
    }

    fn dependencies() -> Vec<DependencyRequest> {
        vec![DependencyRequest::named("instance", INSTANCE)]
    }

    fn build(deps: ResolvedDependencies, _: MethodContext) -> Result<Self, HandlerError> {
        Ok(Self {
            instance: deps.constant::<String>("instance")?,
        })
    }

    async fn handle(&mut self, _: Payload) -> Result<Payload, HandlerError> {
        Ok(Payload::Json(Value::String(self.instance.to_string())))
    }
}

/// Concurrency high-water mark.
#[derive(Debug, Default)]
pub struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Holds the gauge for a while.
pub struct Slow {
    gauge: Arc<Gauge>,
}

#[async_trait]
impl Method for Slow {
    fn settings() -> MethodSettings {
        MethodSettings::new("Slow")
    }

    fn dependencies() -> Vec<DependencyRequest> {
        vec![DependencyRequest::named("gauge", GAUGE)]
    }

    fn build(deps: ResolvedDependencies, _: MethodContext) -> Result<Self, HandlerError> {
        Ok(Self {
            gauge: deps.constant::<Gauge>("gauge")?,
        })
    }

    async fn handle(&mut self, _: Payload) -> Result<Payload, HandlerError> {
        self.gauge.enter();
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.gauge.leave();
        Ok(Payload::Json(Value::Null))
    }
}

/// Answers with the trace id and deadline the handler sees.
pub struct Trace {
    ctx: MethodContext,
}

#[async_trait]
impl Method for Trace {
    fn settings() -> MethodSettings {
        MethodSettings::new("Trace")
    }

    fn build(_: ResolvedDependencies, ctx: MethodContext) -> Result<Self, HandlerError> {
        Ok(Self { ctx })
    }

    async fn handle(&mut self, _: Payload) -> Result<Payload, HandlerError> {
        let baggage = self.ctx.baggage();
        Ok(Payload::json(&json!({
            "traceId": baggage.trace_id,
            "expired": baggage.expired,
            "requestId": baggage.request_id,
        }))?)
    }
}

/// Connection pool whose lifecycle is observable from tests.
#[derive(Default)]
pub struct Pool {
    pub opened: AtomicBool,
    pub closed: Arc<AtomicBool>,
}

#[async_trait]
impl Lifecycle for Pool {
    async fn init(&self) -> Result<(), BoxError> {
        self.opened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub fn math_events() -> EventsDeclaration {
    EventsDeclaration::default()
        .with_event("Elapsed", EventSettings::plain("time spent on a calculation"))
        .with_event("Notify", EventSettings::durable("calculation finished"))
        .with_stream_options(StreamOptions {
            prefix: "math".to_string(),
            actions: vec![StreamAction::new("Notify")],
        })
}

pub fn math_container(instance: &str, gauge: Arc<Gauge>) -> Arc<Container> {
    let container = Container::new();
    container
        .bind(
            REPOSITORY,
            Dependency::adapter(|_: &ConstructorArgs| Ok::<_, BoxError>(Repository::new())),
        )
        .bind(INSTANCE, Dependency::constant(instance.to_string()))
        .bind(GAUGE, Dependency::Constant(gauge));
    Arc::new(container)
}

/// The Math service, not yet built.
pub fn math_service(broker: Arc<dyn Broker>, instance: &str, gauge: Arc<Gauge>) -> ServiceBuilder {
    super::service("Math", broker)
        .method::<Sum>()
        .method::<SumStream>()
        .method::<Fibonacci>()
        .method::<Ticks>()
        .method::<Fail>()
        .method::<Explode>()
        .method::<Lookup>()
        .method::<Remember>()
        .method::<Notify>()
        .method::<WhoAmI>()
        .method::<Slow>()
        .method::<Trace>()
        .events(math_events())
        .kv_bucket("sessions", KvBucketOptions::default())
        .container(math_container(instance, gauge))
}

/// Typed client for the Math service.
pub struct MathClient(pub Client);

impl ServiceClient for MathClient {
    fn from_parts(parts: ClientParts) -> Self {
        MathClient(Client::new("Math", parts))
    }
}

impl MathClient {
    pub async fn sum(&self, a: i64, b: i64) -> Result<i64, RequestError> {
        let response: SumResponse = self
            .0
            .request_json(&self.0.subject("Sum"), &SumRequest { a, b }, &sum_settings())
            .await?;
        Ok(response.result)
    }

    pub async fn trace(&self) -> Result<Value, RequestError> {
        self.0
            .request_json(&self.0.subject("Trace"), &Value::Null, &MethodSettings::new("Trace"))
            .await
    }
}

/// Gateway method that sums through the Math service.
pub struct Proxy {
    math: Arc<MathClient>,
    ctx: MethodContext,
}

#[async_trait]
impl Method for Proxy {
    fn settings() -> MethodSettings {
        MethodSettings::new("Proxy")
    }

    fn dependencies() -> Vec<DependencyRequest> {
        vec![DependencyRequest::named("math", MATH)]
    }

    fn build(deps: ResolvedDependencies, ctx: MethodContext) -> Result<Self, HandlerError> {
        Ok(Self {
            math: deps.service::<MathClient>("math")?,
            ctx,
        })
    }

    async fn handle(&mut self, request: Payload) -> Result<Payload, HandlerError> {
        let SumRequest { a, b } = request.decode()?;
        let result = self.math.sum(a, b).await?;
        let downstream = self.math.trace().await?;
        Ok(Payload::json(&json!({
            "result": result,
            "traceId": self.ctx.baggage().trace_id,
            "downstream": downstream,
        }))?)
    }
}

/// The Gateway service, not yet built.
pub fn gateway_service(broker: Arc<dyn Broker>) -> ServiceBuilder {
    let container = Container::new();
    container.bind(MATH, Dependency::service::<MathClient>());
    super::service("Gateway", broker)
        .method::<Proxy>()
        .container(Arc::new(container))
}
