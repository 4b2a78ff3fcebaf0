//! Shared wire types for the nsc service mesh.
//!
//! Every other crate in the workspace speaks through the types defined here:
//!
//! - [`Baggage`]: trace and deadline context threaded through a call chain
//! - [`Envelope`]: the JSON message carried over the broker
//! - deadline arithmetic ([`compute_deadline`], [`remaining`])
//! - canonical subject, stream and consumer naming ([`subject`])
//! - environment setting lookup ([`settings`])
//!
//! # Wire format
//!
//! ```text
//! request   {"payload": <any>, "baggage": {"traceId", "spanId", "traceFlags", "expired", "requestId"?}}
//! response  {"payload": <any>}
//! error     {"payload": null, "error": {"message": <string>, "code"?: <int>}}
//! ```

mod baggage;
mod deadline;
mod envelope;
mod error;
pub mod settings;
pub mod subject;

#[cfg(feature = "otel")]
mod otel;

pub use baggage::{Baggage, HeaderSource};
pub use deadline::{compute_deadline, is_expired, now_ms, remaining, DeadlinePolicy};
pub use envelope::{build_error_envelope, Envelope, ErrorSource, HttpSettings, RemoteError};
pub use error::ProtoError;

/// Header names used to carry [`Baggage`] over HTTP.
pub mod headers {
    /// Absolute deadline, epoch milliseconds.
    pub const EXPIRED: &str = "nsc-expired";
    pub const TRACE_ID: &str = "nsc-trace-id";
    pub const SPAN_ID: &str = "nsc-span-id";
    pub const TRACE_FLAGS: &str = "nsc-trace-flags";
    pub const REQUEST_ID: &str = "x-request-id";
}

/// Content types used by the HTTP transport.
pub mod content_type {
    pub const JSON: &str = "application/json";
    pub const OCTET_STREAM: &str = "application/octet-stream";
}
