//! Conversion between [`Baggage`] and OpenTelemetry span contexts.

use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};

use crate::baggage::Baggage;

impl Baggage {
    /// Remote span context described by this baggage, if its ids are valid.
    #[must_use]
    pub fn span_context(&self) -> Option<SpanContext> {
        let trace_id = TraceId::from_hex(&self.trace_id).ok()?;
        let span_id = SpanId::from_hex(&self.span_id).ok()?;
        let cx = SpanContext::new(
            trace_id,
            span_id,
            TraceFlags::new(self.trace_flags),
            true,
            TraceState::default(),
        );
        cx.is_valid().then_some(cx)
    }

    /// Baggage naming `cx` as the parent span. Deadline and request id are unset.
    #[must_use]
    pub fn from_span_context(cx: &SpanContext) -> Self {
        Self::new(
            cx.trace_id().to_string(),
            cx.span_id().to_string(),
            cx.trace_flags().to_u8(),
        )
    }
}
