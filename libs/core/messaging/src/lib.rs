//! Broker-agnostic messaging: a managed connection, a fire-and-forget
//! publisher and a reconnecting worker.
//!
//! # Architecture
//!
//! ```text
//!  producer                                        consumer
//! ┌───────────┐   ┌───────────────────┐   ┌───────────────────────┐
//! │ Publisher │──▶│ ConnectionManager │◀──│ Worker ──▶ Processor  │
//! └───────────┘   └─────────┬─────────┘   └───────────────────────┘
//!                           │ Connector / Channel
//!               ┌───────────┴───────────┐
//!               │ nats-broker (JetStream)│  memory::MemoryBroker (tests)
//!               └───────────────────────┘
//! ```
//!
//! Backends implement [`Connector`] and [`Channel`]; the rest of the crate is
//! written against those traits.
//!
//! # Example
//!
//! ```rust,ignore
//! let queue = QueueSpec::from_def::<NotificationQueue>();
//! let connections = Arc::new(ConnectionManager::new(connector, queue.clone(), RetryPolicy::consumer()));
//!
//! let worker = Worker::new(connections, processor, WorkerConfig::new(queue));
//! worker.run(shutdown_rx).await?;
//! ```

mod channel;
mod config;
mod connection;
mod error;
pub mod health;
pub mod memory;
pub mod metrics;
mod processor;
mod publisher;
mod worker;

pub use channel::{Acker, Channel, Connector, Delivery, DeliveryMode, DeliveryStream};
pub use config::{QueueDef, QueueSpec, RetryPolicy, WorkerConfig};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{classify, BrokerError, ErrorCategory, ProcessingError};
pub use processor::Processor;
pub use publisher::{PublishOutcome, Publisher};
pub use worker::Worker;
