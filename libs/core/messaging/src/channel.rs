//! Backend seam: connections, channels and deliveries.
//!
//! A backend (NATS JetStream, the in-memory broker) implements [`Connector`]
//! and [`Channel`]. Everything above this module (connection manager,
//! publisher, worker) is written against these traits only.

use crate::config::QueueSpec;
use crate::error::BrokerError;
use async_trait::async_trait;
use std::fmt;

/// Opens channels to a broker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Channel: Channel;

    /// Open a new connection and return a channel on it.
    async fn connect(&self) -> Result<Self::Channel, BrokerError>;

    /// Backend name for logs and metrics labels.
    fn name(&self) -> &'static str;
}

/// Whether the broker must keep a message across its own restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient,
    Persistent,
}

/// A live channel on an open connection.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Declare the queue. Idempotent; called on every fresh channel.
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError>;

    /// Publish a payload to a queue and wait for the broker to accept it.
    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        mode: DeliveryMode,
    ) -> Result<(), BrokerError>;

    /// Start consuming from a declared queue.
    async fn consume(&self, queue: &QueueSpec) -> Result<Box<dyn DeliveryStream>, BrokerError>;

    /// Cheap liveness check. `false` means the channel must be discarded.
    fn is_open(&self) -> bool;

    /// Close the channel and its connection.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Stream of deliveries from one consumer.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery. `None` means the consumer ended, usually because the
    /// connection went away.
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>>;
}

/// Settles a single delivery on the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// One message handed to a consumer.
///
/// Settling consumes the delivery, so each one is acked or nacked at most once.
/// A delivery dropped without settling stays unacknowledged and is redelivered
/// by the broker once its consumer goes away.
pub struct Delivery {
    tag: u64,
    payload: Vec<u8>,
    delivery_count: u64,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub fn new(tag: u64, payload: Vec<u8>, delivery_count: u64, acker: impl Acker + 'static) -> Self {
        Self {
            tag,
            payload,
            delivery_count,
            acker: Box::new(acker),
        }
    }

    /// Broker-assigned tag identifying this delivery.
    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// How many times the broker has handed this message out, starting at 1.
    pub fn delivery_count(&self) -> u64 {
        self.delivery_count
    }

    pub fn is_redelivered(&self) -> bool {
        self.delivery_count > 1
    }

    /// Acknowledge: the broker forgets the message.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Negative acknowledge. With `requeue` the message goes back on the queue.
    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("payload_len", &self.payload.len())
            .field("delivery_count", &self.delivery_count)
            .finish()
    }
}
