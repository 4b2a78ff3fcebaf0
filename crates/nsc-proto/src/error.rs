//! Error types for the shared base.

use thiserror::Error;

/// Errors raised by the shared base.
#[derive(Error, Debug)]
pub enum ProtoError {
    /// A required environment setting is absent.
    #[error("missing required setting: {0}")]
    MissingSetting(String),

    /// An environment setting is present but cannot be parsed.
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: String, reason: String },

    /// The call deadline has already passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Deserialisation error.
    #[error("deserialisation error: {0}")]
    Deserialisation(String),
}

impl ProtoError {
    /// Returns true for errors that make it impossible to serve requests at all.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::MissingSetting(_) | Self::InvalidSetting { .. })
    }
}
