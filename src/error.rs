use thiserror::Error;

/// Result type alias for PullMQ client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur in the PullMQ consumer client
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// Connection-related errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Broker error
    #[error("Broker error: {0}")]
    Broker(String),

    /// Broker asked the client to slow down
    #[error("Broker busy, retry suggested after {delay_ms}ms")]
    BrokerBusy { delay_ms: u64 },

    /// Network timeout
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid argument to a synchronous operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not allowed in the current lifecycle state
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Consumer errors
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Offset store read/write failure
    #[error("Offset store error: {0}")]
    OffsetStore(String),

    /// Offset out of range
    #[error("Offset out of range: {offset}")]
    OffsetOutOfRange { offset: i64 },

    /// Message serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Consumer group errors
    #[error("Consumer group error: {0}")]
    ConsumerGroup(String),

    /// Internal client error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::OffsetStore(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ClientError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        ClientError::Timeout { timeout_ms: 0 }
    }
}

/// Error categories for metrics and monitoring
impl ClientError {
    /// Get the error category for metrics
    pub fn category(&self) -> &'static str {
        match self {
            ClientError::Connection(_) => "connection",
            ClientError::Broker(_) => "broker",
            ClientError::BrokerBusy { .. } => "flow_control",
            ClientError::Timeout { .. } => "timeout",
            ClientError::InvalidConfig(_) => "configuration",
            ClientError::InvalidArgument(_) => "argument",
            ClientError::IllegalState(_) => "lifecycle",
            ClientError::Consumer(_) | ClientError::ConsumerGroup(_) => "consumer",
            ClientError::OffsetStore(_) => "offset_store",
            ClientError::OffsetOutOfRange { .. } => "offset",
            ClientError::Serialization(_) => "serialization",
            ClientError::Internal(_) => "internal",
        }
    }

    /// Check if the error is retryable by the internal background loops
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Connection(_)
            | ClientError::Broker(_)
            | ClientError::BrokerBusy { .. }
            | ClientError::Timeout { .. }
            | ClientError::OffsetStore(_) => true,

            ClientError::InvalidConfig(_)
            | ClientError::InvalidArgument(_)
            | ClientError::IllegalState(_)
            | ClientError::Serialization(_) => false,

            _ => false,
        }
    }
}
