use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timed out")]
    Timeout,

    #[error("No responders for subject: {0}")]
    NoResponders(String),

    #[error("Broker connection closed")]
    Closed,

    #[error("Message has no reply subject")]
    NoReplySubject,

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("Serialisation error: {0}")]
    Serialisation(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl BrokerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::StreamNotFound(_) | Self::ConsumerNotFound(_))
    }
}
