use std::any::Any;
use std::fmt;

use nsc_broker::BrokerError;
use nsc_proto::{ProtoError, RemoteError};
use thiserror::Error;

use crate::validation::ValidationError;

/// Failure of an outgoing request, as seen by the caller.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The deadline had already passed before the request was sent.
    #[error("deadline exceeded before {subject} was sent")]
    Timeout { subject: String },

    #[error("transport error: {0}")]
    Transport(String),

    /// The remote handler answered with an error envelope.
    #[error("{message}")]
    Remote { message: String, code: Option<i64> },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialisation error: {0}")]
    Serialisation(String),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl RequestError {
    /// Application error code carried by a remote error.
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Remote { code, .. } => *code,
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<RemoteError> for RequestError {
    fn from(err: RemoteError) -> Self {
        Self::Remote {
            message: err.message,
            code: err.code,
        }
    }
}

impl From<ProtoError> for RequestError {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::Serialisation(msg) | ProtoError::Deserialisation(msg) => {
                Self::Serialisation(msg)
            }
            other => Self::Configuration(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialisation(err.to_string())
    }
}

/// Error returned by a method handler.
///
/// Any `std::error::Error` converts into it with `?`. Remote errors keep
/// their application code so it survives another hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub message: String,
    pub code: Option<i64>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    /// Wire form of this error.
    pub fn to_remote(&self) -> RemoteError {
        RemoteError {
            message: self.message.clone(),
            code: self.code,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        let code = (&err as &dyn Any)
            .downcast_ref::<RequestError>()
            .and_then(RequestError::code);
        Self {
            message: err.to_string(),
            code,
        }
    }
}

/// Errors raised while declaring streams or consumers.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Errors raised by [`Emitter::emit`](crate::Emitter::emit).
#[derive(Debug, Error)]
pub enum EmitError {
    #[error("event not declared: {0}")]
    UnknownEvent(String),

    #[error("event {0} is a stream event but no stream prefix is declared")]
    MissingStreamPrefix(String),

    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Errors raised by a [`Service`](crate::Service) outside the request path.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Missing or invalid configuration at startup. The process should exit.
    #[error("fatal startup error: {0}")]
    FatalStartup(String),

    #[error("service already started")]
    AlreadyStarted,

    #[error("duplicate method action: {0}")]
    DuplicateMethod(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Container(#[from] crate::container::ContainerError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalStartup(_) | Self::Config(_))
    }
}

impl From<ProtoError> for ServiceError {
    fn from(err: ProtoError) -> Self {
        Self::FatalStartup(err.to_string())
    }
}
