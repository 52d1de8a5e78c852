//! Error types for broker access and message processing.

use std::fmt;
use thiserror::Error;

/// Error categories determine whether an operation is worth repeating.
///
/// # Categories
///
/// - **Transient**: the broker or a downstream service is temporarily
///   unreachable; reconnect or redeliver and try again
/// - **Fatal**: retrying cannot help (bad credentials, malformed data,
///   protocol violation)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection refused, dropped, timed out
    Transient,

    /// Authentication failure, protocol error, invalid payload
    Fatal,
}

impl ErrorCategory {
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorCategory::Fatal)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Fatal => write!(f, "fatal"),
        }
    }
}

/// Errors raised by a broker backend or the connection manager.
///
/// Backends translate their native client errors into these variants so that
/// retry decisions are made against one vocabulary (see [`classify`]).
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Could not open a connection (refused, DNS, TLS handshake aborted)
    #[error("failed to connect to broker: {0}")]
    ConnectionFailed(String),

    /// An established connection or channel went away
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),

    /// Bounded reconnection gave up
    #[error("broker unavailable after {attempts} connection attempts")]
    Unavailable { attempts: u32 },

    /// Broker did not answer in time (publish confirm, fetch)
    #[error("broker operation timed out: {0}")]
    Timeout(String),

    /// Credentials rejected or permission denied
    #[error("broker rejected credentials: {0}")]
    Authentication(String),

    /// The broker refused the request for a reason that will not go away on retry
    #[error("broker protocol error: {0}")]
    Protocol(String),

    /// The channel was closed locally
    #[error("channel closed")]
    Closed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost(message.into())
    }

    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        classify(self)
    }

    /// Whether the error means the channel it came from can no longer be used.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionFailed(_)
                | BrokerError::ConnectionLost(_)
                | BrokerError::Unavailable { .. }
                | BrokerError::Timeout(_)
                | BrokerError::Closed
        )
    }
}

/// Map any broker error onto the transient/fatal split.
///
/// Transient errors are connection-level: the caller should drop its channel,
/// reconnect and try again. Everything else is fatal for the operation that
/// produced it.
pub fn classify(error: &BrokerError) -> ErrorCategory {
    if error.is_connection_error() {
        ErrorCategory::Transient
    } else {
        ErrorCategory::Fatal
    }
}

/// Error returned by a [`Processor`](crate::Processor) for one message.
///
/// - Transient errors leave the message on the queue (nack with requeue)
/// - Permanent and serialization errors drop it (ack without effect)
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// Transient error (mail relay down, network timeout)
    #[error("transient error: {message}")]
    Transient { message: String },

    /// Permanent error (invalid data, unsupported operation)
    #[error("permanent error: {message}")]
    Permanent { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ProcessingError {
    /// Create a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Create a permanent error.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProcessingError::Transient { .. } => ErrorCategory::Transient,
            ProcessingError::Permanent { .. } => ErrorCategory::Fatal,
            ProcessingError::Serialization(_) => ErrorCategory::Fatal,
        }
    }

    /// Whether the message should be put back on the queue.
    pub fn should_requeue(&self) -> bool {
        self.category().is_transient()
    }
}
