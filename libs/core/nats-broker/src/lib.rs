//! NATS JetStream backend for the `messaging` connection manager.
//!
//! Maps the queue vocabulary onto JetStream:
//!
//! | queue concept        | JetStream                                     |
//! |----------------------|-----------------------------------------------|
//! | durable queue        | work-queue stream, file storage               |
//! | persistent publish   | publish + awaited PubAck                      |
//! | consumer             | durable pull consumer, explicit ack           |
//! | ack / nack(requeue)  | `+ACK` / `-NAK` with a redelivery delay       |
//! | nack(no requeue)     | `+TERM`                                       |
//!
//! # Example
//!
//! ```rust,ignore
//! use messaging::{ConnectionManager, QueueSpec, RetryPolicy};
//! use nats_broker::{NatsBrokerConfig, NatsConnector};
//!
//! let connector = NatsConnector::new(NatsBrokerConfig::new("nats://localhost:4222"));
//! let connections = ConnectionManager::new(
//!     connector,
//!     QueueSpec::durable("notification_queue"),
//!     RetryPolicy::publisher(),
//! );
//! ```

mod config;
mod connector;
pub mod error;
mod stream;

pub use config::NatsBrokerConfig;
pub use connector::{NatsChannel, NatsConnector};
pub use stream::NatsDeliveryStream;
