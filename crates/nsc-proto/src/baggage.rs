//! Trace and deadline context carried along a call chain.

use serde::{Deserialize, Serialize};

use crate::headers;

/// Trace context plus the absolute deadline of the current call.
///
/// A `Baggage` always carries the full trace triple. Header sets that lack
/// any part of it decode to `None` rather than a partial value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Baggage {
    /// Hex-encoded 16-byte trace id.
    pub trace_id: String,

    /// Hex-encoded 8-byte span id of the caller's span.
    pub span_id: String,

    /// W3C trace flags.
    pub trace_flags: u8,

    /// Absolute deadline, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Baggage {
    #[must_use]
    pub fn new(trace_id: impl Into<String>, span_id: impl Into<String>, trace_flags: u8) -> Self {
        Self {
            trace_id: trace_id.into(),
            span_id: span_id.into(),
            trace_flags,
            expired: None,
            request_id: None,
        }
    }

    #[must_use]
    pub fn with_expired(mut self, expired: u64) -> Self {
        self.expired = Some(expired);
        self
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Returns true when the baggage deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expired.is_some_and(crate::is_expired)
    }

    /// Encodes the baggage as HTTP headers.
    #[must_use]
    pub fn to_headers(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![
            (headers::TRACE_ID, self.trace_id.clone()),
            (headers::SPAN_ID, self.span_id.clone()),
            (headers::TRACE_FLAGS, self.trace_flags.to_string()),
        ];
        if let Some(expired) = self.expired {
            out.push((headers::EXPIRED, expired.to_string()));
        }
        if let Some(request_id) = &self.request_id {
            out.push((headers::REQUEST_ID, request_id.clone()));
        }
        out
    }

    /// Decodes baggage from HTTP headers.
    ///
    /// Returns `None` unless trace id, span id and trace flags are all present
    /// and well formed.
    pub fn from_headers<S: HeaderSource + ?Sized>(source: &S) -> Option<Self> {
        let trace_id = source.header(headers::TRACE_ID)?;
        let span_id = source.header(headers::SPAN_ID)?;
        let trace_flags = source.header(headers::TRACE_FLAGS)?.trim().parse().ok()?;
        if trace_id.is_empty() || span_id.is_empty() {
            return None;
        }

        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            trace_flags,
            expired: source
                .header(headers::EXPIRED)
                .and_then(|v| v.trim().parse().ok()),
            request_id: source.header(headers::REQUEST_ID).map(str::to_string),
        })
    }
}

/// Read access to a set of headers.
pub trait HeaderSource {
    /// Looks up a header by name, case-insensitively.
    fn header(&self, name: &str) -> Option<&str>;
}

impl HeaderSource for http::HeaderMap {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.to_str().ok())
    }
}

impl HeaderSource for [(String, String)] {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

impl HeaderSource for Vec<(String, String)> {
    fn header(&self, name: &str) -> Option<&str> {
        self.as_slice().header(name)
    }
}
