//! Translation of async-nats errors into [`BrokerError`].

use async_nats::{ConnectError, ConnectErrorKind};
use messaging::BrokerError;
use std::fmt::Display;

/// Map a connection failure. Rejected credentials and unparsable server
/// addresses are fatal; everything else is worth another attempt.
pub fn from_connect_error(error: ConnectError) -> BrokerError {
    match error.kind() {
        ConnectErrorKind::Authentication | ConnectErrorKind::AuthorizationViolation => {
            BrokerError::Authentication(error.to_string())
        }
        ConnectErrorKind::ServerParse => BrokerError::protocol(error.to_string()),
        ConnectErrorKind::TimedOut => BrokerError::Timeout(error.to_string()),
        _ => BrokerError::connection_failed(error.to_string()),
    }
}

/// Map a JetStream API, publish or ack error by its message.
///
/// async-nats reports these through several per-call error types; the
/// message text is the common denominator.
pub fn from_jetstream_error(error: impl Display) -> BrokerError {
    let message = error.to_string();
    let lowered = message.to_lowercase();

    if lowered.contains("timed out") || lowered.contains("timeout") {
        BrokerError::Timeout(message)
    } else if lowered.contains("broken pipe")
        || lowered.contains("disconnected")
        || lowered.contains("connection")
        || lowered.contains("no responders")
        || lowered.contains("stream not found")
        || lowered.contains("consumer deleted")
        || lowered.contains("missed idle heartbeat")
        || lowered.contains("missing heartbeat")
    {
        BrokerError::ConnectionLost(message)
    } else if lowered.contains("authorization") || lowered.contains("permission") {
        BrokerError::Authentication(message)
    } else {
        BrokerError::Protocol(message)
    }
}
