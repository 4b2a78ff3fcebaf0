//! Tracing and logging.
//!
//! Each [`Service`](crate::Service) owns a tracer. Spans are parented on
//! incoming [`Baggage`] and their ids flow onward as the next hop's baggage.
//! Failed spans carry `error = true` and `error.kind = <message>`.

use std::borrow::Cow;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use nsc_proto::Baggage;
use opentelemetry::trace::{
    Span as _, SpanKind, Status, TraceContextExt, Tracer as _, TracerProvider as _,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::{self, Sampler, Span, Tracer, TracerProvider};
use tracing_subscriber::EnvFilter;

/// Installs the global `fmt` subscriber, filtered by `RUST_LOG` (default `info`).
///
/// Returns false when a subscriber was already installed.
pub fn init_logging() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Tracer owned by one service or client.
#[derive(Clone)]
pub struct Telemetry {
    provider: TracerProvider,
    tracer: Tracer,
}

impl Telemetry {
    /// Always-on sampling, no exporter.
    pub fn new(service_name: impl Into<String>) -> Self {
        let provider = TracerProvider::builder()
            .with_config(trace::config().with_sampler(Sampler::AlwaysOn))
            .build();
        Self::with_provider(provider, service_name)
    }

    /// Uses a caller-built provider, e.g. one with an exporter attached.
    pub fn with_provider(provider: TracerProvider, service_name: impl Into<String>) -> Self {
        let tracer = provider.tracer(service_name.into());
        Self { provider, tracer }
    }

    /// Starts a span. With no valid parent baggage the span is a new root.
    pub fn start_span(
        &self,
        name: impl Into<Cow<'static, str>>,
        kind: SpanKind,
        parent: Option<&Baggage>,
    ) -> TraceSpan {
        let cx = parent
            .and_then(Baggage::span_context)
            .map(|sc| Context::new().with_remote_span_context(sc))
            .unwrap_or_default();
        self.start_child(name, kind, &cx)
    }

    pub fn start_child(
        &self,
        name: impl Into<Cow<'static, str>>,
        kind: SpanKind,
        parent: &Context,
    ) -> TraceSpan {
        let mut builder = self.tracer.span_builder(name);
        builder.span_kind = Some(kind);
        TraceSpan {
            span: self.tracer.build_with_context(builder, parent),
        }
    }

    /// Flushes finished spans to any configured exporter.
    pub fn flush(&self) {
        for result in self.provider.force_flush() {
            if let Err(err) = result {
                tracing::debug!(error = %err, "span flush failed");
            }
        }
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry").finish_non_exhaustive()
    }
}

/// An open span. Ends when [`TraceSpan::end`] is called or on drop.
pub struct TraceSpan {
    span: Span,
}

impl TraceSpan {
    pub fn trace_id(&self) -> String {
        self.span.span_context().trace_id().to_string()
    }

    pub fn span_id(&self) -> String {
        self.span.span_context().span_id().to_string()
    }

    /// Baggage naming this span as parent. No deadline is set.
    pub fn baggage(&self) -> Baggage {
        Baggage::from_span_context(self.span.span_context())
    }

    /// Context for starting children of this span.
    pub fn context(&self) -> Context {
        Context::new().with_remote_span_context(self.span.span_context().clone())
    }

    pub fn set_attribute(&mut self, key: &'static str, value: impl Into<String>) {
        self.span.set_attribute(KeyValue::new(key, value.into()));
    }

    pub fn record_error(&mut self, message: &str) {
        self.span.set_attribute(KeyValue::new("error", true));
        self.span
            .set_attribute(KeyValue::new("error.kind", message.to_string()));
        self.span.set_status(Status::error(message.to_string()));
    }

    pub fn end(mut self) {
        self.span.end();
    }

    pub fn end_with_error(mut self, message: &str) {
        self.record_error(message);
        self.span.end();
    }
}

/// Open root spans keyed by trace id.
#[derive(Default)]
pub struct RootSpans {
    spans: DashMap<String, TraceSpan>,
}

impl RootSpans {
    pub fn insert(&self, span: TraceSpan) -> String {
        let trace_id = span.trace_id();
        self.spans.insert(trace_id.clone(), span);
        trace_id
    }

    /// Ends the root span of `trace_id`. Returns false when none is open.
    pub fn end(&self, trace_id: &str, error: Option<&str>) -> bool {
        match self.spans.remove(trace_id) {
            Some((_, span)) => {
                match error {
                    Some(message) => span.end_with_error(message),
                    None => span.end(),
                }
                true
            }
            None => false,
        }
    }

    pub fn end_all(&self) {
        let ids: Vec<String> = self.spans.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.end(&id, None);
        }
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

/// An adapter wrapped so each call runs inside a child span.
///
/// Adapters declared `External` get `Client` spans; internal ones get
/// `Internal` spans.
pub struct Traced<T: ?Sized> {
    inner: Arc<T>,
    telemetry: Telemetry,
    parent: Context,
    kind: SpanKind,
}

impl<T: ?Sized> Clone for Traced<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            telemetry: self.telemetry.clone(),
            parent: self.parent.clone(),
            kind: self.kind.clone(),
        }
    }
}

impl<T: ?Sized + Send + Sync> Traced<T> {
    pub fn new(inner: Arc<T>, telemetry: Telemetry, parent: Context, kind: SpanKind) -> Self {
        Self {
            inner,
            telemetry,
            parent,
            kind,
        }
    }

    pub fn inner(&self) -> &Arc<T> {
        &self.inner
    }

    pub fn kind(&self) -> &SpanKind {
        &self.kind
    }

    /// Runs an async adapter call in a span named `operation`.
    pub async fn call<'a, F, Fut, R, E>(&'a self, operation: &'static str, f: F) -> Result<R, E>
    where
        F: FnOnce(&'a T) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: Display,
    {
        let mut span = self
            .telemetry
            .start_child(operation, self.kind.clone(), &self.parent);
        let result = f(&self.inner).await;
        if let Err(err) = &result {
            span.record_error(&err.to_string());
        }
        span.end();
        result
    }

    /// Runs a synchronous adapter call in a span named `operation`.
    pub fn call_sync<R>(&self, operation: &'static str, f: impl FnOnce(&T) -> R) -> R {
        let span = self
            .telemetry
            .start_child(operation, self.kind.clone(), &self.parent);
        let result = f(&self.inner);
        span.end();
        result
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use futures::future::BoxFuture;
    use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};

    use super::*;

    /// Collects finished spans for assertions.
    #[derive(Clone, Debug, Default)]
    pub(crate) struct CollectingExporter {
        spans: Arc<Mutex<Vec<SpanData>>>,
    }

    impl CollectingExporter {
        pub(crate) fn finished(&self) -> Vec<SpanData> {
            self.spans.lock().map(|s| s.clone()).unwrap_or_default()
        }
    }

    impl SpanExporter for CollectingExporter {
        fn export(&mut self, mut batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
            if let Ok(mut spans) = self.spans.lock() {
                spans.append(&mut batch);
            }
            Box::pin(async { Ok(()) })
        }
    }

    pub(crate) fn collecting(service: &str) -> (Telemetry, CollectingExporter) {
        let exporter = CollectingExporter::default();
        let provider = TracerProvider::builder()
            .with_config(trace::config().with_sampler(Sampler::AlwaysOn))
            .with_simple_exporter(exporter.clone())
            .build();
        (Telemetry::with_provider(provider, service), exporter)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::collecting;
    use super::*;

    fn attr(span: &opentelemetry_sdk::export::trace::SpanData, key: &str) -> Option<String> {
        span.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.to_string())
    }

    #[test]
    fn child_span_continues_parent_trace() {
        let telemetry = Telemetry::new("Math");
        let root = telemetry.start_span("Math.Sum", SpanKind::Client, None);
        let baggage = root.baggage();
        assert_eq!(baggage.trace_id, root.trace_id());
        assert_eq!(baggage.expired, None);

        let child = telemetry.start_span("Math.Sum", SpanKind::Server, Some(&baggage));
        assert_eq!(child.trace_id(), root.trace_id());
        assert_ne!(child.span_id(), root.span_id());
    }

    #[test]
    fn invalid_parent_starts_new_root() {
        let telemetry = Telemetry::new("Math");
        let bogus = Baggage::new("not-hex", "nope", 1);
        let span = telemetry.start_span("x", SpanKind::Server, Some(&bogus));
        assert_ne!(span.trace_id(), "not-hex");
        assert_eq!(span.trace_id().len(), 32);
    }

    #[test]
    fn failed_spans_carry_error_attributes() {
        let (telemetry, exporter) = collecting("Math");
        let span = telemetry.start_span("Math.Sum", SpanKind::Server, None);
        span.end_with_error("boom");
        telemetry.flush();

        let finished = exporter.finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(attr(&finished[0], "error").as_deref(), Some("true"));
        assert_eq!(attr(&finished[0], "error.kind").as_deref(), Some("boom"));
    }

    #[test]
    fn root_spans_end_once() {
        let telemetry = Telemetry::new("Gateway");
        let roots = RootSpans::default();
        let id = roots.insert(telemetry.start_span("Gateway.request", SpanKind::Server, None));
        assert_eq!(roots.len(), 1);
        assert!(roots.end(&id, None));
        assert!(!roots.end(&id, None));
        assert!(roots.is_empty());
    }

    struct Repository;

    impl Repository {
        async fn find(&self, id: u32) -> Result<u32, std::io::Error> {
            if id == 0 {
                Err(std::io::Error::other("missing"))
            } else {
                Ok(id * 10)
            }
        }
    }

    #[tokio::test]
    async fn traced_calls_open_child_spans() {
        let (telemetry, exporter) = collecting("Math");
        let parent = telemetry.start_span("Math.Sum", SpanKind::Server, None);
        let traced = Traced::new(
            Arc::new(Repository),
            telemetry.clone(),
            parent.context(),
            SpanKind::Client,
        );

        assert_eq!(traced.call("find", |repo| repo.find(2)).await.unwrap(), 20);
        assert!(traced.call("find", |repo| repo.find(0)).await.is_err());
        telemetry.flush();

        let finished = exporter.finished();
        assert_eq!(finished.len(), 2);
        assert!(finished.iter().all(|s| s.name == "find"));
        assert!(finished
            .iter()
            .all(|s| s.span_context.trace_id().to_string() == parent.trace_id()));
        assert_eq!(attr(&finished[1], "error.kind").as_deref(), Some("missing"));
    }
}
