//! Per-request handling and the broker receive pumps.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use nsc_broker::{Broker, IncomingMessage, KvBucket, Subscription};
use nsc_proto::subject::method_subject;
use nsc_proto::{build_error_envelope, Baggage, Envelope, ErrorSource, HttpSettings};
use opentelemetry::trace::SpanKind;
use opentelemetry::Context;
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::shutdown::request_scope;
use crate::client::ClientParts;
use crate::container::{
    Container, ContainerError, Dependency, DependencyKey, DependencySource, ResolvedDependencies,
    ResolvedDependency,
};
use crate::error::HandlerError;
use crate::events::Emitter;
use crate::method::{MethodContext, MethodDescriptor};
use crate::payload::Payload;
use crate::telemetry::Telemetry;

/// State shared by every request a service handles.
pub(crate) struct Dispatcher {
    pub name: Arc<str>,
    pub container: Arc<Container>,
    pub telemetry: Telemetry,
    pub emitter: Emitter,
    /// Template for clients handed to handlers; baggage is set per request.
    pub parts: ClientParts,
    pub buckets: RwLock<HashMap<String, Arc<dyn KvBucket>>>,
}

impl Dispatcher {
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.parts.broker
    }

    pub fn client_parts(&self, baggage: Option<Baggage>) -> ClientParts {
        self.parts.clone().with_baggage(baggage)
    }

    /// Runs one request through `method`. Handler failures, including
    /// panics, come back as `Err` and never escape.
    pub async fn handled(
        &self,
        method: &MethodDescriptor,
        request: Payload,
        inbound: Option<Baggage>,
    ) -> Result<Payload, HandlerError> {
        let subject = method_subject(&self.name, method.action());
        let mut span = self
            .telemetry
            .start_span(subject.clone(), SpanKind::Server, inbound.as_ref());
        span.set_attribute("nsc.subject", subject);

        let mut next = span.baggage();
        if let Some(inbound) = &inbound {
            if let Some(expired) = inbound.expired {
                next = next.with_expired(expired);
            }
            if let Some(id) = &inbound.request_id {
                next = next.with_request_id(id.clone());
            }
        }

        let log = tracing::info_span!(
            "request",
            service = %self.name,
            action = %method.action(),
            trace_id = %span.trace_id(),
            request_id = next.request_id.as_deref().unwrap_or_default(),
        );
        let result = self
            .invoke(method, request, next, span.context())
            .instrument(log.clone())
            .await;

        match &result {
            Ok(_) => span.end(),
            Err(err) => {
                log.in_scope(|| tracing::error!(error = %err, "request failed"));
                span.end_with_error(&err.message);
            }
        }
        result
    }

    async fn invoke(
        &self,
        method: &MethodDescriptor,
        request: Payload,
        next: Baggage,
        parent: Context,
    ) -> Result<Payload, HandlerError> {
        let deps = self.resolve(method, &next, parent)?;
        let ctx = MethodContext::new(
            self.name.clone(),
            method.action().to_string(),
            next,
            self.emitter.clone(),
        );
        let mut handler = method.instantiate(deps, ctx)?;
        let run = request_scope(async move { handler.handle(request).await });
        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::new(panic_message(panic.as_ref()))),
        }
    }

    fn resolve(
        &self,
        method: &MethodDescriptor,
        next: &Baggage,
        parent: Context,
    ) -> Result<ResolvedDependencies, ContainerError> {
        let mut deps = ResolvedDependencies::new(self.telemetry.clone(), parent);
        for request in method.dependencies() {
            let resolved = match request.source {
                DependencySource::Bucket(name) => {
                    let bucket = self
                        .buckets
                        .read()
                        .get(name)
                        .cloned()
                        .ok_or(ContainerError::NotBound(DependencyKey::new(name)))?;
                    ResolvedDependency::Bucket(bucket)
                }
                DependencySource::Key(key) => match self.container.get(key)?.dependency {
                    Dependency::Service(factory) => {
                        ResolvedDependency::Service(factory(self.client_parts(Some(next.clone()))))
                    }
                    Dependency::Constant(value) => ResolvedDependency::Constant(value),
                    Dependency::Adapter { options, .. } => ResolvedDependency::Adapter {
                        value: self.container.get_instance(key)?,
                        location: options.location,
                    },
                },
            };
            deps.insert(request.slot, resolved);
        }
        Ok(deps)
    }

    /// Broker form of [`Dispatcher::handled`]: envelope bytes in, envelope out.
    pub async fn reply(&self, method: &MethodDescriptor, body: &[u8]) -> Envelope {
        let request = match Envelope::decode(body) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(service = %self.name, action = %method.action(), error = %err, "malformed request");
                return build_error_envelope(ErrorSource::Error(&err), None);
            }
        };
        match self
            .handled(method, Payload::Json(request.payload), request.baggage)
            .await
        {
            Ok(Payload::Json(value)) => Envelope::ok(value),
            Ok(Payload::Stream(_)) => build_error_envelope(
                ErrorSource::Message("streamed responses are only served over HTTP"),
                None,
            ),
            Err(err) => build_error_envelope(ErrorSource::Message(&err.message), err.code),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown cause".to_string());
    format!("handler panicked: {detail}")
}

/// Receives requests for one method and answers each on its own task.
///
/// Delivery order is preserved into the pump. With a `limit`, the pump waits
/// for a permit before taking the next message.
pub(crate) fn spawn_pump(
    dispatcher: Arc<Dispatcher>,
    method: MethodDescriptor,
    mut subscription: Subscription<IncomingMessage>,
    limit: Option<Arc<Semaphore>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let permit = match &limit {
                Some(limit) => tokio::select! {
                    () = cancel.cancelled() => break,
                    permit = limit.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                None => None,
            };
            let message = tokio::select! {
                () = cancel.cancelled() => break,
                next = subscription.next_message() => match next {
                    Some(message) => message,
                    None => break,
                },
            };

            let dispatcher = dispatcher.clone();
            let method = method.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let envelope = dispatcher.reply(&method, &message.payload).await;
                if !message.is_respondable() {
                    return;
                }
                let body = envelope.encode().unwrap_or_default();
                if let Err(err) = message.respond(Bytes::from(body)).await {
                    tracing::warn!(subject = %message.subject, error = %err, "failed to send reply");
                }
            });
        }
        tracing::debug!(subject = subscription.subject(), "request pump stopped");
    })
}

/// Answers `<service>.get_http_settings` with the HTTP listener's address.
pub(crate) fn spawn_settings_responder(
    mut subscription: Subscription<IncomingMessage>,
    settings: HttpSettings,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let body = match serde_json::to_vec(&settings) {
            Ok(body) => Bytes::from(body),
            Err(err) => {
                tracing::error!(error = %err, "cannot encode HTTP settings");
                return;
            }
        };
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => break,
                next = subscription.next_message() => match next {
                    Some(message) => message,
                    None => break,
                },
            };
            if let Err(err) = message.respond(body.clone()).await {
                tracing::debug!(error = %err, "failed to answer HTTP settings request");
            }
        }
    })
}
