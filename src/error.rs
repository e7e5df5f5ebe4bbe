use thiserror::Error;

use crate::CorrelationId;

/// Errors surfaced by the messaging core.
#[derive(Error, Debug)]
pub enum Error {
    /// No reply arrived before the caller's deadline.
    #[error("request timed out")]
    Timeout,

    /// A correlation ID was registered while an entry for it was still pending.
    #[error("duplicate correlation id: {0}")]
    DuplicateCorrelationId(CorrelationId),

    /// The handler on the remote side reported an error in its reply.
    #[error("remote error: {0}")]
    Remote(String),

    /// Broker connection, channel or queue failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Transient broker failure that may succeed when retried (connect only).
    #[error("transport error (retryable): {0}")]
    TransportRetryable(String),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The payload parsed as JSON but is not a valid envelope.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Operation not permitted in the core's mode.
    #[error("invalid mode: {0}")]
    InvalidMode(String),

    /// A required configuration value was not supplied.
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    /// A configuration value could not be parsed or is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Two configuration settings contradict each other.
    #[error("configuration conflict: {0}")]
    ConfigConflict(String),

    /// The messaging core was shut down while the operation was in flight.
    #[error("messaging core is shut down")]
    Shutdown,
}

/// Result type alias for messaging operations
pub type Result<T> = std::result::Result<T, Error>;
