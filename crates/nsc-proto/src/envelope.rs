//! The JSON message exchanged between clients and services.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::baggage::Baggage;
use crate::error::ProtoError;

/// A request or response message.
///
/// Requests carry `payload` and `baggage`; responses carry `payload`, or a
/// null payload plus `error` when the handler failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub payload: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baggage: Option<Baggage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

/// Error details returned by a remote handler. No stack traces cross the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl Envelope {
    /// Creates a request envelope.
    #[must_use]
    pub fn request(payload: Value, baggage: Option<Baggage>) -> Self {
        Self {
            payload,
            baggage,
            error: None,
        }
    }

    /// Creates a successful response envelope.
    #[must_use]
    pub fn ok(payload: Value) -> Self {
        Self {
            payload,
            baggage: None,
            error: None,
        }
    }

    /// Creates an error envelope from an error value.
    #[must_use]
    pub fn from_error(error: &(dyn std::error::Error + '_), code: Option<i64>) -> Self {
        build_error_envelope(ErrorSource::Error(error), code)
    }

    /// Creates an error envelope from a message.
    #[must_use]
    pub fn from_message(message: &str, code: Option<i64>) -> Self {
        build_error_envelope(ErrorSource::Message(message), code)
    }

    /// Creates an error envelope from an arbitrary JSON value.
    #[must_use]
    pub fn from_value(value: &Value, code: Option<i64>) -> Self {
        build_error_envelope(ErrorSource::Value(value), code)
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Splits the envelope into the payload or the remote error.
    pub fn into_result(self) -> Result<Value, RemoteError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.payload),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        serde_json::to_vec(self).map_err(|e| ProtoError::Serialisation(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        serde_json::from_slice(bytes).map_err(|e| ProtoError::Deserialisation(e.to_string()))
    }
}

/// What an error envelope is built from.
#[derive(Debug, Clone, Copy)]
pub enum ErrorSource<'a> {
    /// An error value; its `Display` output becomes the message.
    Error(&'a (dyn std::error::Error + 'a)),
    /// A plain message.
    Message(&'a str),
    /// Anything else; strings are used as-is, other values are serialised.
    Value(&'a Value),
}

impl ErrorSource<'_> {
    fn message(&self) -> String {
        match self {
            Self::Error(e) => e.to_string(),
            Self::Message(m) => (*m).to_string(),
            Self::Value(Value::String(s)) => s.clone(),
            Self::Value(v) => v.to_string(),
        }
    }
}

/// Builds `{payload: null, error: {message, code}}`.
#[must_use]
pub fn build_error_envelope(source: ErrorSource<'_>, code: Option<i64>) -> Envelope {
    Envelope {
        payload: Value::Null,
        baggage: None,
        error: Some(RemoteError {
            message: source.message(),
            code,
        }),
    }
}

/// Address of a service's HTTP listener, as answered by `<service>.get_http_settings`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSettings {
    pub ip: String,
    pub port: u16,
}

impl HttpSettings {
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.ip, self.port)
    }
}
