//! Configuration types for queues, reconnection and workers.

use std::time::Duration;

/// Queue definition trait (for type-safe constants).
///
/// ```rust,ignore
/// struct NotificationQueue;
///
/// impl QueueDef for NotificationQueue {
///     const QUEUE_NAME: &'static str = "notification_queue";
/// }
/// ```
pub trait QueueDef {
    /// Queue name shared by producers and consumers
    const QUEUE_NAME: &'static str;

    /// Whether the queue survives a broker restart (default: true)
    const DURABLE: bool = true;

    /// Durable consumer name, defaults to `{QUEUE_NAME}_workers`
    fn consumer_name() -> String {
        format!("{}_workers", Self::QUEUE_NAME)
    }
}

/// Declared shape of a queue, handed to the backend on every fresh channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    /// Name of the durable consumer that workers attach to
    pub consumer: String,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        let name = name.into();
        let consumer = format!("{}_workers", name);
        Self {
            name,
            durable: true,
            consumer,
        }
    }

    pub fn from_def<D: QueueDef>() -> Self {
        Self {
            name: D::QUEUE_NAME.to_string(),
            durable: D::DURABLE,
            consumer: D::consumer_name(),
        }
    }
}

/// Bounded reconnection policy: a fixed number of attempts with a fixed delay
/// between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Connection attempts before giving up (at least one is always made)
    pub max_attempts: u32,

    /// Pause between two attempts
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Publisher side: 7 attempts, 5 s apart.
    pub fn publisher() -> Self {
        Self::new(7, Duration::from_secs(5))
    }

    /// Consumer side: 5 attempts, 5 s apart.
    pub fn consumer() -> Self {
        Self::new(5, Duration::from_secs(5))
    }

    /// Single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::consumer()
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Queue to consume from
    pub queue: QueueSpec,

    /// Consumer tag (unique per worker instance, used in logs)
    pub consumer_tag: String,

    /// Wait before the first connection attempt, gives the broker time to boot
    pub startup_delay: Duration,

    /// Wait after a dropped connection before reconnecting
    pub reconnect_delay: Duration,

    /// 1 = strictly sequential; >1 = that many deliveries in flight at once
    pub max_concurrent_deliveries: usize,
}

impl WorkerConfig {
    pub fn new(queue: QueueSpec) -> Self {
        Self {
            consumer_tag: format!("{}-{}", queue.consumer, uuid::Uuid::new_v4()),
            queue,
            startup_delay: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(5),
            max_concurrent_deliveries: 1,
        }
    }

    pub fn from_def<D: QueueDef>() -> Self {
        Self::new(QueueSpec::from_def::<D>())
    }

    pub fn with_consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the delivery concurrency (values below 1 are treated as 1).
    pub fn with_max_concurrent_deliveries(mut self, max: usize) -> Self {
        self.max_concurrent_deliveries = max.max(1);
        self
    }

    pub fn is_sequential(&self) -> bool {
        self.max_concurrent_deliveries <= 1
    }
}
