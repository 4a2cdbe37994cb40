use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Failed to deserialize result of {operation}: {reason}")]
    ResultDeserialization { operation: String, reason: String },

    #[error("Operation alias could not be resolved: {0}")]
    AliasResolution(String),

    #[error("Remote exception: {0}")]
    Remote(RemoteError),

    #[error("Call {correlation_id} timed out after {timeout:?}")]
    Timeout {
        correlation_id: String,
        timeout: Duration,
    },

    #[error("Call {0} was cancelled before a reply arrived")]
    Cancelled(String),

    #[error("Correlation id {0} is already pending")]
    DuplicateCorrelationId(String),

    #[error("Operation {0} is already subscribed")]
    AlreadySubscribed(String),

    #[error("No broker uri was provided and none was preset")]
    MissingUri,

    #[error("Blocking call not allowed here: {0}")]
    BlockingCall(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed after {attempts} attempts: {reason}")]
    ConnectFailed { attempts: usize, reason: String },

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Session was already set up, reset it first")]
    AlreadySetup,

    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Broker error: {0}")]
    Broker(String),
}

/// Failure of a remote handler, carried back to the caller inside a reply.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{operation} failed: {message}")]
pub struct RemoteError {
    pub operation: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RemoteError {
    pub fn new(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
pub type TransportResult<T> = std::result::Result<T, TransportError>;

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Serialization(err.to_string())
    }
}

impl From<RemoteError> for RpcError {
    fn from(err: RemoteError) -> Self {
        RpcError::Remote(err)
    }
}
