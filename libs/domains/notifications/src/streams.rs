//! Queue definitions for the notifications domain.

use messaging::QueueDef;

/// Task events waiting to be turned into notifications.
///
/// Shared by the task service (producer) and the notification worker.
pub struct NotificationQueue;

impl QueueDef for NotificationQueue {
    const QUEUE_NAME: &'static str = "notification_queue";
}
