//! Notifications Domain
//!
//! Task lifecycle events and what the notification worker does with them.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │    Task Service    │  ← calls TaskEventPublisher after create/update/delete/complete
//! └─────────┬──────────┘
//!           │
//! ┌─────────▼──────────┐
//! │ notification_queue │  ← durable queue (NATS JetStream)
//! └─────────┬──────────┘
//!           │
//! ┌─────────▼──────────┐
//! │ Notification Worker│  ← messaging::Worker + NotificationProcessor
//! └─────────┬──────────┘
//!           │
//! ┌─────────▼──────────┐
//! │ NotificationAction │  ← EmailAction (SMTP) or LogAction
//! └────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use domain_notifications::{
//!     EmailAction, NotificationProcessor, NotificationQueue, TaskEvent,
//!     providers::SmtpProvider,
//! };
//!
//! // Producer
//! let publisher = TaskEventPublisher::new(connections, PublisherConfig::from_env()?);
//! publisher.publish_detached(TaskEvent::created("Write report", Some(email)));
//!
//! // Consumer
//! let processor = NotificationProcessor::new(EmailAction::new(SmtpProvider::from_env()?));
//! let queue = QueueSpec::from_def::<NotificationQueue>();
//! let worker = Worker::new(connections, processor, WorkerConfig::new(queue));
//! worker.run(shutdown_rx).await?;
//! ```

pub mod action;
pub mod error;
pub mod models;
pub mod processor;
pub mod providers;
pub mod publisher;
pub mod streams;

pub use action::{DeliveryOutcome, EmailAction, LogAction, NotificationAction};
pub use error::{NotificationError, NotificationResult};
pub use models::{Operation, TaskEvent, TaskRef};
pub use processor::NotificationProcessor;
pub use publisher::{PublisherConfig, TaskEventPublisher};
pub use streams::NotificationQueue;
