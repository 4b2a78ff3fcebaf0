//! Caller side of the mesh.
//!
//! [`Client::request`] validates, applies the deadline, consults the cache,
//! then sends over the broker or, for streaming methods, directly over HTTP.
//! Transport failures are caught at the transport boundary and come back
//! through the same error path as remote handler failures, so a call ends
//! either in a payload or in an error, never both.

mod http;
mod listener;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nsc_broker::Broker;
use nsc_proto::subject::method_subject;
use nsc_proto::{remaining, Baggage, DeadlinePolicy, Envelope};
use opentelemetry::trace::SpanKind;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::{cache_key, CacheSettings};
use crate::error::RequestError;
use crate::events::EventsDeclaration;
use crate::method::MethodSettings;
use crate::payload::Payload;
use crate::streams::ListenerOptions;
use crate::telemetry::{Telemetry, TraceSpan};
use crate::validation::{BasicValidator, SchemaValidator};

pub use listener::{EventDelivery, EventListener, EventMessage, HandlerId};

/// Everything a client shares with the service or gateway that created it.
#[derive(Clone)]
pub struct ClientParts {
    pub broker: Arc<dyn Broker>,
    /// Context of the request this client was created for.
    pub baggage: Option<Baggage>,
    pub cache: Option<CacheSettings>,
    pub telemetry: Telemetry,
    pub deadline: DeadlinePolicy,
    pub validator: Arc<dyn SchemaValidator>,
    pub http: reqwest::Client,
    /// Name of the calling service; used for durable consumer names.
    pub caller: Option<Arc<str>>,
}

impl ClientParts {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            baggage: None,
            cache: None,
            telemetry: Telemetry::new("nsc-client"),
            deadline: DeadlinePolicy::without_default(),
            validator: Arc::new(BasicValidator::new()),
            http: reqwest::Client::new(),
            caller: None,
        }
    }

    pub fn with_baggage(mut self, baggage: Option<Baggage>) -> Self {
        self.baggage = baggage;
        self
    }
}

/// A typed client for one service, buildable from shared [`ClientParts`].
///
/// ```ignore
/// struct MathClient(Client);
///
/// impl ServiceClient for MathClient {
///     fn from_parts(parts: ClientParts) -> Self {
///         MathClient(Client::new("Math", parts))
///     }
/// }
/// ```
pub trait ServiceClient: Send + Sync + 'static {
    fn from_parts(parts: ClientParts) -> Self;
}

/// Outcome of a transport call, before error mapping.
enum Reply {
    Envelope(Envelope),
    Stream(crate::payload::ByteStream),
    /// Broker or HTTP failure, or a reply that could not be decoded.
    Transport(String),
}

/// Client for the methods and events of one target service.
#[derive(Clone)]
pub struct Client {
    service: Arc<str>,
    parts: ClientParts,
    events: Arc<EventsDeclaration>,
}

impl Client {
    pub fn new(service: impl Into<Arc<str>>, parts: ClientParts) -> Self {
        Self {
            service: service.into(),
            parts,
            events: Arc::new(EventsDeclaration::default()),
        }
    }

    pub fn builder(service: impl Into<Arc<str>>, broker: Arc<dyn Broker>) -> ClientBuilder {
        ClientBuilder {
            service: service.into(),
            parts: ClientParts::new(broker),
            events: EventsDeclaration::default(),
        }
    }

    /// Declares the target's events, needed by [`Client::listener`].
    pub fn with_events(mut self, events: EventsDeclaration) -> Self {
        self.events = Arc::new(events);
        self
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub fn parts(&self) -> &ClientParts {
        &self.parts
    }

    /// `<service>.<action>` for this client's service.
    pub fn subject(&self, action: &str) -> String {
        method_subject(&self.service, action)
    }

    /// Calls `settings.action` on this client's service.
    pub async fn call(&self, payload: Payload, settings: &MethodSettings) -> Result<Payload, RequestError> {
        let subject = self.subject(&settings.action);
        self.request(&subject, payload, settings).await
    }

    /// JSON in, JSON out.
    pub async fn request_json<Req, Resp>(
        &self,
        subject: &str,
        request: &Req,
        settings: &MethodSettings,
    ) -> Result<Resp, RequestError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = Payload::json(request)?;
        match self.request(subject, payload, settings).await? {
            Payload::Json(value) => Ok(serde_json::from_value(value)?),
            Payload::Stream(_) => Err(RequestError::Serialisation(format!(
                "{subject} answered with a stream"
            ))),
        }
    }

    /// Sends `payload` to `subject` and returns the response payload.
    pub async fn request(
        &self,
        subject: &str,
        payload: Payload,
        settings: &MethodSettings,
    ) -> Result<Payload, RequestError> {
        let mut span = self.parts.telemetry.start_span(
            subject.to_string(),
            SpanKind::Client,
            self.parts.baggage.as_ref(),
        );
        span.set_attribute("nsc.subject", subject);

        let result = self.exchange(subject, payload, settings, &span).await;
        match &result {
            Ok(_) => span.end(),
            Err(err) => {
                tracing::debug!(subject, error = %err, "request failed");
                span.end_with_error(&err.to_string());
            }
        }
        result
    }

    async fn exchange(
        &self,
        subject: &str,
        payload: Payload,
        settings: &MethodSettings,
        span: &TraceSpan,
    ) -> Result<Payload, RequestError> {
        if settings.validates_request() {
            if let (Some(schema), Payload::Json(value)) = (&settings.request, &payload) {
                self.parts.validator.validate(schema, value)?;
            }
        }

        let inherited = self.parts.baggage.as_ref().and_then(|b| b.expired);
        let expired = self.parts.deadline.deadline(inherited, settings.timeout())?;
        let Some(timeout) = remaining(expired) else {
            return Err(RequestError::Timeout {
                subject: subject.to_string(),
            });
        };

        let cache = match (&self.parts.cache, settings.cache_ttl(), &payload) {
            (Some(cache), Some(ttl), Payload::Json(value)) => Some((cache, ttl, cache_key(subject, value))),
            _ => None,
        };
        if let Some((cache, _, key)) = &cache {
            if let Some(hit) = cache.lookup(key).await {
                tracing::debug!(subject, "cache hit");
                return Ok(Payload::Json(hit));
            }
        }

        let mut baggage = span.baggage().with_expired(expired);
        if let Some(id) = self.parts.baggage.as_ref().and_then(|b| b.request_id.clone()) {
            baggage = baggage.with_request_id(id);
        }

        let reply = if settings.uses_http() {
            http::send(&self.parts, subject, payload, &baggage, timeout, settings.streams_response()).await
        } else {
            self.send_broker(subject, payload, baggage, timeout).await
        };

        let value = match reply {
            Reply::Stream(stream) => return Ok(Payload::Stream(stream)),
            Reply::Transport(message) => return Err(RequestError::Transport(message)),
            Reply::Envelope(envelope) => envelope.into_result()?,
        };

        if settings.validates_response() {
            if let Some(schema) = &settings.response {
                self.parts.validator.validate(schema, &value)?;
            }
        }

        if let Some((cache, ttl, key)) = cache {
            cache.store(key, &value, ttl);
        }
        Ok(Payload::Json(value))
    }

    async fn send_broker(
        &self,
        subject: &str,
        payload: Payload,
        baggage: Baggage,
        timeout: Duration,
    ) -> Reply {
        let Payload::Json(value) = payload else {
            return Reply::Transport(format!(
                "{subject} is not a streaming method; streamed requests need HTTP"
            ));
        };
        let body = match Envelope::request(value, Some(baggage)).encode() {
            Ok(body) => body,
            Err(err) => return Reply::Transport(err.to_string()),
        };
        match self.parts.broker.request(subject, Bytes::from(body), timeout).await {
            Ok(reply) => match Envelope::decode(&reply) {
                Ok(envelope) => Reply::Envelope(envelope),
                Err(err) => Reply::Transport(err.to_string()),
            },
            Err(err) => Reply::Transport(err.to_string()),
        }
    }

    /// Event listener for this client's service.
    ///
    /// The caller name comes from the parts; standalone clients use `caller`.
    pub fn listener(&self, caller: impl Into<String>, options: ListenerOptions) -> EventListener {
        let caller = self
            .parts
            .caller
            .as_deref()
            .map(str::to_string)
            .unwrap_or_else(|| caller.into());
        EventListener::new(
            caller,
            self.service.clone(),
            self.events.clone(),
            self.parts.broker.clone(),
            options,
        )
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("service", &self.service)
            .field("baggage", &self.parts.baggage)
            .finish_non_exhaustive()
    }
}

/// Builder for standalone clients, e.g. in gateways and tests.
#[must_use]
pub struct ClientBuilder {
    service: Arc<str>,
    parts: ClientParts,
    events: EventsDeclaration,
}

impl ClientBuilder {
    pub fn baggage(mut self, baggage: Baggage) -> Self {
        self.parts.baggage = Some(baggage);
        self
    }

    pub fn cache(mut self, cache: CacheSettings) -> Self {
        self.parts.cache = Some(cache);
        self
    }

    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.parts.telemetry = telemetry;
        self
    }

    pub fn deadline_policy(mut self, policy: DeadlinePolicy) -> Self {
        self.parts.deadline = policy;
        self
    }

    /// Shorthand for a deadline policy with this default timeout.
    pub fn default_timeout(self, timeout: Duration) -> Self {
        self.deadline_policy(DeadlinePolicy::new(timeout))
    }

    pub fn validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.parts.validator = validator;
        self
    }

    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.parts.http = http;
        self
    }

    pub fn caller(mut self, caller: impl Into<Arc<str>>) -> Self {
        self.parts.caller = Some(caller.into());
        self
    }

    pub fn events(mut self, events: EventsDeclaration) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Client {
        Client::new(self.service, self.parts).with_events(self.events)
    }
}
