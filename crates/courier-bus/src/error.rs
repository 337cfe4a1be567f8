//! # Errors
//!
//! Error types surfaced by the bus and by broker adapters.
//!
//! Both enums are `Clone`: a single connect attempt is shared between every
//! caller waiting on it, and each of them receives the same outcome.

use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// HTTP-style status carried by [`TimeoutError`] ("service unavailable").
pub const TIMEOUT_STATUS_CODE: u16 = 503;

/// Errors reported by a broker adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The transport connection failed or was lost.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A channel-level operation was refused by the broker.
    #[error("Channel error: {0}")]
    Channel(String),

    /// The referenced queue, exchange or delivery does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An exclusive resource is owned by another connection.
    #[error("Resource locked: {0}")]
    ResourceLocked(String),

    /// The connection or channel was already closed.
    #[error("Channel closed")]
    Closed,
}

/// Raised when an RPC call (or a server handler) exceeds its time budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutError {
    message: String,
}

impl TimeoutError {
    /// Create a timeout error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The human readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Always [`TIMEOUT_STATUS_CODE`].
    pub fn status_code(&self) -> u16 {
        TIMEOUT_STATUS_CODE
    }
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {})", self.message, TIMEOUT_STATUS_CODE)
    }
}

impl std::error::Error for TimeoutError {}

/// The error type for bus operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BusError {
    // ============================================================================
    // Connection
    // ============================================================================
    /// Establishing the transport or opening the channel failed.
    ///
    /// Every caller waiting on the same connect attempt receives this error.
    #[error("Failed to connect to broker: {0}")]
    Connect(String),

    /// A broker call failed after the connection was established.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    // ============================================================================
    // RPC
    // ============================================================================
    /// The call did not receive a reply within its time budget.
    #[error("{0}")]
    Timeout(TimeoutError),

    /// The remote handler signalled failure. The value is passed through verbatim.
    #[error("Remote handler failed: {0}")]
    Remote(Value),

    /// A reply listener is already registered for this correlation id.
    #[error("Correlation id {0} is already awaiting a reply")]
    DuplicateCorrelation(String),

    /// The reply consumer stopped before a reply arrived.
    #[error("Reply channel closed before a reply arrived")]
    ReplyChannelClosed,

    // ============================================================================
    // Payloads
    // ============================================================================
    /// The payload could not be represented in the wire format.
    #[error("Failed to encode payload: {0}")]
    Encode(String),

    /// Inbound bytes were not valid JSON or did not match the expected type.
    #[error("Failed to decode payload: {0}")]
    Decode(String),
}

impl BusError {
    /// Returns true for [`BusError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// The remote failure value, if this is a [`BusError::Remote`].
    pub fn remote_value(&self) -> Option<&Value> {
        match self {
            Self::Remote(value) => Some(value),
            _ => None,
        }
    }
}

impl From<TimeoutError> for BusError {
    fn from(err: TimeoutError) -> Self {
        Self::Timeout(err)
    }
}
