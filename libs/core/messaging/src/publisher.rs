//! Fire-and-forget publishing with a single reconnect-and-retry.

use crate::channel::{Channel, Connector, DeliveryMode};
use crate::connection::ConnectionManager;
use crate::error::BrokerError;
use crate::metrics::PublisherMetrics;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// What happened to a published message. Never an error for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted by the broker on the first try
    Delivered,
    /// Accepted after reconnecting once
    DeliveredAfterReconnect,
    /// Logged and discarded
    Dropped,
}

/// Publishes messages to the managed queue.
///
/// A connection-level failure invalidates the channel and the publish is
/// retried exactly once on a fresh one. Any other failure, or a failed retry,
/// is logged and the message dropped.
pub struct Publisher<C: Connector> {
    connections: Arc<ConnectionManager<C>>,
    metrics: PublisherMetrics,
}

impl<C: Connector> Clone for Publisher<C> {
    fn clone(&self) -> Self {
        Self {
            connections: Arc::clone(&self.connections),
            metrics: self.metrics.clone(),
        }
    }
}

impl<C: Connector> Publisher<C> {
    pub fn new(connections: Arc<ConnectionManager<C>>) -> Self {
        let metrics = PublisherMetrics::new(&connections.queue().name);
        Self {
            connections,
            metrics,
        }
    }

    /// Serialize and publish `message` as a persistent message.
    pub async fn publish<T: Serialize + ?Sized>(&self, message: &T) -> PublishOutcome {
        let queue = &self.connections.queue().name;

        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(e) => {
                error!(queue = %queue, error = %e, "Failed to serialize message, dropping");
                self.metrics.dropped("serialization");
                return PublishOutcome::Dropped;
            }
        };

        let channel = match self.connections.acquire_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(queue = %queue, error = %e, "No broker channel, dropping message");
                self.metrics.dropped("unavailable");
                return PublishOutcome::Dropped;
            }
        };

        let first_error = match self.send(&channel, payload.clone()).await {
            Ok(()) => {
                self.metrics.published();
                return PublishOutcome::Delivered;
            }
            Err(e) => e,
        };

        if !first_error.is_connection_error() {
            error!(queue = %queue, error = %first_error, "Publish rejected, dropping message");
            self.metrics.dropped("rejected");
            return PublishOutcome::Dropped;
        }

        warn!(
            queue = %queue,
            error = %first_error,
            "Broker connection broken during publish, reconnecting"
        );
        self.connections.invalidate(&channel).await;
        self.metrics.retried();

        let retry_channel = match self.connections.acquire_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(queue = %queue, error = %e, "Reconnect failed, dropping message");
                self.metrics.dropped("reconnect_failed");
                return PublishOutcome::Dropped;
            }
        };

        match self.send(&retry_channel, payload).await {
            Ok(()) => {
                info!(queue = %queue, "Message published after reconnect");
                self.metrics.published();
                PublishOutcome::DeliveredAfterReconnect
            }
            Err(e) => {
                error!(queue = %queue, error = %e, "Publish retry failed, dropping message");
                if e.is_connection_error() {
                    self.connections.invalidate(&retry_channel).await;
                }
                self.metrics.dropped("retry_failed");
                PublishOutcome::Dropped
            }
        }
    }

    /// Publish on a detached task. The handle only signals completion.
    pub fn publish_detached<T>(&self, message: T) -> JoinHandle<()>
    where
        T: Serialize + Send + Sync + 'static,
    {
        let publisher = self.clone();
        tokio::spawn(async move {
            publisher.publish(&message).await;
        })
    }

    async fn send(&self, channel: &Arc<C::Channel>, payload: Vec<u8>) -> Result<(), BrokerError> {
        channel
            .publish(
                &self.connections.queue().name,
                payload,
                DeliveryMode::Persistent,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueSpec, RetryPolicy};
    use crate::memory::MemoryBroker;
    use serde::Serialize;
    use std::time::Duration;

    #[derive(Serialize)]
    struct Ping {
        n: u32,
    }

    fn publisher(broker: &MemoryBroker) -> Publisher<MemoryBroker> {
        let connections = Arc::new(ConnectionManager::new(
            broker.clone(),
            QueueSpec::durable("pings"),
            RetryPolicy::new(2, Duration::from_secs(5)),
        ));
        Publisher::new(connections)
    }

    #[tokio::test]
    async fn test_publish_persistent_message() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);

        let outcome = publisher.publish(&Ping { n: 1 }).await;

        assert_eq!(outcome, PublishOutcome::Delivered);
        let messages = broker.messages("pings");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, br#"{"n":1}"#.to_vec());
        assert!(messages[0].persistent);
    }

    #[tokio::test]
    async fn test_reconnects_once_on_broken_connection() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);
        publisher.publish(&Ping { n: 1 }).await;

        broker.break_on_next_publish();
        let outcome = publisher.publish(&Ping { n: 2 }).await;

        assert_eq!(outcome, PublishOutcome::DeliveredAfterReconnect);
        assert_eq!(broker.queue_depth("pings"), 2);
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drops_when_reconnect_fails() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);
        publisher.publish(&Ping { n: 1 }).await;

        broker.break_on_next_publish();
        broker.set_down(true);
        let outcome = publisher.publish(&Ping { n: 2 }).await;

        assert_eq!(outcome, PublishOutcome::Dropped);
        broker.set_down(false);
        assert_eq!(broker.queue_depth("pings"), 1);
    }

    #[tokio::test]
    async fn test_retries_only_once() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);

        broker.break_on_next_publishes(2);
        let outcome = publisher.publish(&Ping { n: 1 }).await;

        assert_eq!(outcome, PublishOutcome::Dropped);
        assert_eq!(broker.publish_attempts(), 2);
        assert_eq!(broker.queue_depth("pings"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drops_when_broker_never_reachable() {
        let broker = MemoryBroker::new();
        broker.set_down(true);
        let publisher = publisher(&broker);

        let outcome = publisher.publish(&Ping { n: 1 }).await;

        assert_eq!(outcome, PublishOutcome::Dropped);
        assert_eq!(broker.publish_attempts(), 0);
    }

    #[tokio::test]
    async fn test_fatal_publish_error_is_not_retried() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);

        broker.reject_next_publish();
        let outcome = publisher.publish(&Ping { n: 1 }).await;

        assert_eq!(outcome, PublishOutcome::Dropped);
        assert_eq!(broker.publish_attempts(), 1);
    }

    #[tokio::test]
    async fn test_rejected_publish_keeps_channel() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);

        broker.reject_next_publish();
        assert_eq!(publisher.publish(&Ping { n: 1 }).await, PublishOutcome::Dropped);
        assert_eq!(publisher.publish(&Ping { n: 2 }).await, PublishOutcome::Delivered);

        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.queue_depth("pings"), 1);
    }

    #[tokio::test]
    async fn test_publish_detached_completes() {
        let broker = MemoryBroker::new();
        let publisher = publisher(&broker);

        publisher.publish_detached(Ping { n: 7 }).await.unwrap();

        assert_eq!(broker.queue_depth("pings"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_detached_swallows_failures() {
        let broker = MemoryBroker::new();
        broker.set_down(true);
        let publisher = publisher(&broker);

        let handle = publisher.publish_detached(Ping { n: 7 });

        assert!(handle.await.is_ok());
    }
}
