//! Method declarations and handler instantiation.
//!
//! A method is a type implementing [`Method`]. The dispatcher builds a fresh
//! instance per request from its resolved dependencies, then calls
//! [`Method::handle`] once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nsc_proto::Baggage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::container::{DependencyRequest, ResolvedDependencies};
use crate::error::HandlerError;
use crate::events::Emitter;
use crate::payload::Payload;

/// Static declaration of a method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodSettings {
    pub action: String,
    #[serde(default)]
    pub options: MethodOptions,
    /// JSON schema for the request payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Value>,
    /// JSON schema for the response payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_stream: Option<UseStream>,
    /// Response cache TTL in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<u64>,
    /// Per-call timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_time_validation: Option<RunTimeValidation>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UseStream {
    #[serde(default)]
    pub request: bool,
    #[serde(default)]
    pub response: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTimeValidation {
    #[serde(default)]
    pub request: bool,
    #[serde(default)]
    pub response: bool,
}

impl MethodSettings {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Self::default()
        }
    }

    pub fn with_request_schema(mut self, schema: Value) -> Self {
        self.request = Some(schema);
        self
    }

    pub fn with_response_schema(mut self, schema: Value) -> Self {
        self.response = Some(schema);
        self
    }

    /// Marks request and/or response as byte streams, which routes the method over HTTP.
    pub fn streaming(mut self, request: bool, response: bool) -> Self {
        self.options.use_stream = Some(UseStream { request, response });
        self
    }

    /// Caches responses for `ttl`, rounded up to whole seconds.
    pub fn with_cache(mut self, ttl: Duration) -> Self {
        let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        self.options.cache = Some(secs);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn validated(mut self, request: bool, response: bool) -> Self {
        self.options.run_time_validation = Some(RunTimeValidation { request, response });
        self
    }

    pub fn streams_request(&self) -> bool {
        self.options.use_stream.is_some_and(|s| s.request)
    }

    pub fn streams_response(&self) -> bool {
        self.options.use_stream.is_some_and(|s| s.response)
    }

    /// HTTP methods are the ones streaming either side.
    pub fn uses_http(&self) -> bool {
        self.streams_request() || self.streams_response()
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.options
            .cache
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.options.timeout.map(Duration::from_millis)
    }

    pub fn validates_request(&self) -> bool {
        self.options.run_time_validation.is_some_and(|v| v.request)
    }

    pub fn validates_response(&self) -> bool {
        self.options.run_time_validation.is_some_and(|v| v.response)
    }
}

/// Per-request context handed to [`Method::build`].
#[derive(Clone)]
pub struct MethodContext {
    service: Arc<str>,
    action: String,
    baggage: Baggage,
    emitter: Emitter,
}

impl MethodContext {
    pub(crate) fn new(service: Arc<str>, action: String, baggage: Baggage, emitter: Emitter) -> Self {
        Self {
            service,
            action,
            baggage,
            emitter,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    /// Baggage naming this request's span as parent, with the inherited deadline.
    pub fn baggage(&self) -> &Baggage {
        &self.baggage
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }
}

/// A method handler.
///
/// ```ignore
/// struct Sum;
///
/// #[async_trait]
/// impl Method for Sum {
///     fn settings() -> MethodSettings {
///         MethodSettings::new("Sum")
///     }
///
///     fn build(_: ResolvedDependencies, _: MethodContext) -> Result<Self, HandlerError> {
///         Ok(Sum)
///     }
///
///     async fn handle(&mut self, request: Payload) -> Result<Payload, HandlerError> {
///         let SumRequest { a, b } = request.decode()?;
///         Ok(Payload::json(&SumResponse { result: a + b })?)
///     }
/// }
/// ```
#[async_trait]
pub trait Method: Send + Sized + 'static {
    fn settings() -> MethodSettings;

    /// Dependencies injected into each instance.
    fn dependencies() -> Vec<DependencyRequest> {
        Vec::new()
    }

    fn build(deps: ResolvedDependencies, ctx: MethodContext) -> Result<Self, HandlerError>;

    async fn handle(&mut self, request: Payload) -> Result<Payload, HandlerError>;
}

#[async_trait]
pub(crate) trait Handler: Send {
    async fn handle(&mut self, request: Payload) -> Result<Payload, HandlerError>;
}

struct Erased<M>(M);

#[async_trait]
impl<M: Method> Handler for Erased<M> {
    async fn handle(&mut self, request: Payload) -> Result<Payload, HandlerError> {
        self.0.handle(request).await
    }
}

type Factory =
    Arc<dyn Fn(ResolvedDependencies, MethodContext) -> Result<Box<dyn Handler>, HandlerError> + Send + Sync>;

/// Type-erased method registration.
#[derive(Clone)]
pub struct MethodDescriptor {
    settings: Arc<MethodSettings>,
    dependencies: Arc<[DependencyRequest]>,
    factory: Factory,
}

impl MethodDescriptor {
    pub fn of<M: Method>() -> Self {
        Self {
            settings: Arc::new(M::settings()),
            dependencies: M::dependencies().into(),
            factory: Arc::new(|deps: ResolvedDependencies, ctx: MethodContext| {
                let method = M::build(deps, ctx)?;
                Ok(Box::new(Erased(method)) as Box<dyn Handler>)
            }),
        }
    }

    pub fn settings(&self) -> &MethodSettings {
        &self.settings
    }

    pub fn action(&self) -> &str {
        &self.settings.action
    }

    pub fn dependencies(&self) -> &[DependencyRequest] {
        &self.dependencies
    }

    pub(crate) fn instantiate(
        &self,
        deps: ResolvedDependencies,
        ctx: MethodContext,
    ) -> Result<Box<dyn Handler>, HandlerError> {
        (self.factory)(deps, ctx)
    }
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("action", &self.settings.action)
            .field("dependencies", &self.dependencies.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settings_deserialise_from_declaration() {
        let settings: MethodSettings = serde_json::from_value(json!({
            "action": "Fibonacci",
            "options": {
                "useStream": {"response": true},
                "cache": 60,
                "timeout": 2500,
                "runTimeValidation": {"request": true}
            },
            "request": {"type": "integer"}
        }))
        .unwrap();

        assert_eq!(settings.action, "Fibonacci");
        assert!(settings.uses_http());
        assert!(!settings.streams_request());
        assert!(settings.streams_response());
        assert_eq!(settings.cache_ttl(), Some(Duration::from_secs(60)));
        assert_eq!(settings.timeout(), Some(Duration::from_millis(2500)));
        assert!(settings.validates_request());
        assert!(!settings.validates_response());
    }

    #[test]
    fn plain_methods_use_the_broker() {
        let settings = MethodSettings::new("Sum");
        assert!(!settings.uses_http());
        assert_eq!(settings.cache_ttl(), None);
        assert_eq!(settings.timeout(), None);

        let settings = MethodSettings::new("Sum").streaming(false, false);
        assert!(!settings.uses_http());
    }

    #[test]
    fn sub_second_cache_ttl_rounds_up() {
        let settings = MethodSettings::new("Sum").with_cache(Duration::from_millis(250));
        assert_eq!(settings.cache_ttl(), Some(Duration::from_secs(1)));

        let settings = MethodSettings::new("Sum").with_cache(Duration::from_millis(1500));
        assert_eq!(settings.cache_ttl(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn zero_cache_ttl_disables_caching() {
        let settings = MethodSettings::new("Sum").with_cache(Duration::ZERO);
        assert_eq!(settings.cache_ttl(), None);
    }
}
