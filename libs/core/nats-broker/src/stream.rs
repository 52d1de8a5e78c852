//! Pull-consumer message stream and per-message settlement.

use crate::error::from_jetstream_error;
use async_nats::jetstream::consumer::pull;
use async_nats::jetstream::{AckKind, Message};
use async_trait::async_trait;
use futures::StreamExt;
use messaging::{Acker, BrokerError, Delivery, DeliveryStream};
use std::time::Duration;
use tracing::warn;

/// Deliveries from a durable pull consumer.
pub struct NatsDeliveryStream {
    messages: pull::Stream,
    nak_delay: Duration,
}

impl NatsDeliveryStream {
    pub(crate) fn new(messages: pull::Stream, nak_delay: Duration) -> Self {
        Self {
            messages,
            nak_delay,
        }
    }
}

#[async_trait]
impl DeliveryStream for NatsDeliveryStream {
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        let message = match self.messages.next().await? {
            Ok(message) => message,
            Err(e) => return Some(Err(BrokerError::connection_lost(e.to_string()))),
        };

        let (sequence, delivered) = match message.info() {
            Ok(info) => (info.stream_sequence, info.delivered.max(1) as u64),
            Err(e) => {
                warn!(error = %e, "Message without JetStream metadata");
                (0, 1)
            }
        };
        let payload = message.payload.to_vec();

        Some(Ok(Delivery::new(
            sequence,
            payload,
            delivered,
            NatsAcker {
                message,
                nak_delay: self.nak_delay,
            },
        )))
    }
}

/// Settles one JetStream message.
///
/// Ack is `+ACK`; nack with requeue is `-NAK` redelivered after
/// `nak_delay`; nack without requeue is `+TERM`.
struct NatsAcker {
    message: Message,
    nak_delay: Duration,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.message.ack().await.map_err(from_jetstream_error)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        let kind = if requeue {
            nak_kind(self.nak_delay)
        } else {
            AckKind::Term
        };
        self.message.ack_with(kind).await.map_err(from_jetstream_error)
    }
}

/// A zero delay asks the server for immediate redelivery.
fn nak_kind(delay: Duration) -> AckKind {
    if delay.is_zero() {
        AckKind::Nak(None)
    } else {
        AckKind::Nak(Some(delay))
    }
}
