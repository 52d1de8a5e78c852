//! Producer side: what the task service calls after a task changes.

use crate::models::{Operation, TaskEvent, TaskRef};
use core_config::{FromEnv, env_flag};
use messaging::{ConnectionManager, Connector, PublishOutcome, Publisher};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Publisher settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherConfig {
    /// When false, events are discarded without touching the broker.
    pub enabled: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl FromEnv for PublisherConfig {
    /// `BACKGROUND_TASK_DISABLED` set to a truthy value disables publishing.
    fn from_env() -> Result<Self, core_config::ConfigError> {
        Ok(Self {
            enabled: !env_flag("BACKGROUND_TASK_DISABLED"),
        })
    }
}

/// Publishes task events to the notification queue.
///
/// Never fails from the caller's point of view: broker problems are logged
/// and the event is dropped.
pub struct TaskEventPublisher<C: Connector> {
    publisher: Publisher<C>,
    config: PublisherConfig,
}

impl<C: Connector> Clone for TaskEventPublisher<C> {
    fn clone(&self) -> Self {
        Self {
            publisher: self.publisher.clone(),
            config: self.config,
        }
    }
}

impl<C: Connector> TaskEventPublisher<C> {
    pub fn new(connections: Arc<ConnectionManager<C>>, config: PublisherConfig) -> Self {
        Self {
            publisher: Publisher::new(connections),
            config,
        }
    }

    /// Publish an event and wait for the broker's answer.
    pub async fn publish(&self, event: &TaskEvent) -> PublishOutcome {
        if !self.config.enabled {
            debug!(operation = %event.operation, "Background tasks disabled, event discarded");
            return PublishOutcome::Dropped;
        }
        self.publisher.publish(event).await
    }

    /// Publish from a detached task so the caller's request is not delayed.
    /// Returns `None` when publishing is disabled.
    pub fn publish_detached(&self, event: TaskEvent) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            debug!(operation = %event.operation, "Background tasks disabled, event discarded");
            return None;
        }
        Some(self.publisher.publish_detached(event))
    }

    /// Convenience for `publish_detached(TaskEvent::new(..))`.
    pub fn notify(
        &self,
        operation: Operation,
        task: impl Into<TaskRef>,
        recipient: Option<String>,
    ) -> Option<JoinHandle<()>> {
        self.publish_detached(TaskEvent::new(operation, task, recipient))
    }
}
