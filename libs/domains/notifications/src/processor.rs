//! Notification processor for the queue worker.
//!
//! `NotificationProcessor` implements `Processor<TaskEvent>`: every consumed
//! event is handed to a [`NotificationAction`] and the outcome decides
//! whether the worker acks or requeues.

use crate::action::{DeliveryOutcome, NotificationAction};
use crate::models::TaskEvent;
use async_trait::async_trait;
use messaging::{ProcessingError, Processor};
use std::sync::Arc;
use tracing::info;

/// Dispatches task events to a notification action.
///
/// - `Delivered`: `Ok(())`, the worker acks
/// - `Failed`: transient error, the worker requeues for redelivery
/// - `Rejected`: permanent error, the worker acks and drops the event
#[derive(Clone)]
pub struct NotificationProcessor {
    action: Arc<dyn NotificationAction>,
}

impl NotificationProcessor {
    pub fn new(action: impl NotificationAction + 'static) -> Self {
        Self {
            action: Arc::new(action),
        }
    }

    pub fn with_arc(action: Arc<dyn NotificationAction>) -> Self {
        Self { action }
    }

    pub fn action_name(&self) -> &'static str {
        self.action.name()
    }
}

#[async_trait]
impl Processor<TaskEvent> for NotificationProcessor {
    async fn process(&self, event: &TaskEvent) -> Result<(), ProcessingError> {
        info!(
            operation = %event.operation,
            task = %event.task,
            action = self.action.name(),
            "Processing task event"
        );

        match self.action.notify(event).await {
            DeliveryOutcome::Delivered => Ok(()),
            DeliveryOutcome::Failed(reason) => Err(ProcessingError::transient(format!(
                "{} notification failed: {}",
                self.action.name(),
                reason
            ))),
            DeliveryOutcome::Rejected(reason) => Err(ProcessingError::permanent(format!(
                "{} notification rejected: {}",
                self.action.name(),
                reason
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "NotificationProcessor"
    }

    async fn health_check(&self) -> Result<bool, ProcessingError> {
        Ok(self.action.health_check().await)
    }
}
