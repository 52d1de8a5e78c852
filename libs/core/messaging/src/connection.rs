//! Process-wide broker connection with lazy, bounded reconnection.

use crate::channel::{Channel, Connector};
use crate::config::{QueueSpec, RetryPolicy};
use crate::error::BrokerError;
use crate::metrics::ConnectionMetrics;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Lifecycle of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection yet, or closed
    Absent,
    /// Connection attempts in progress
    Connecting,
    /// Channel open and queue declared
    Open,
    /// Last channel observed broken, not yet replaced
    Broken,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Absent => write!(f, "absent"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Broken => write!(f, "broken"),
        }
    }
}

/// Owns the single reusable channel of a process.
///
/// The channel is created on first use and recreated after it breaks. Creation
/// and teardown hold one async mutex, so concurrent callers never race to open
/// two connections. Publishing, acking and nacking on the returned channel do
/// not take that lock.
///
/// Share it with `Arc` between the publisher and the worker.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    queue: QueueSpec,
    policy: RetryPolicy,
    current: Mutex<Option<Arc<C::Channel>>>,
    state: watch::Sender<ConnectionState>,
    metrics: ConnectionMetrics,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, queue: QueueSpec, policy: RetryPolicy) -> Self {
        let (state, _) = watch::channel(ConnectionState::Absent);
        let metrics = ConnectionMetrics::new(connector.name());
        Self {
            connector,
            queue,
            policy,
            current: Mutex::new(None),
            state,
            metrics,
        }
    }

    /// Queue declared on every fresh channel.
    pub fn queue(&self) -> &QueueSpec {
        &self.queue
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Return the open channel, connecting first if there is none.
    ///
    /// A cached channel that reports itself closed is discarded. Connection is
    /// attempted up to `policy.max_attempts` times with `policy.delay` between
    /// attempts; a fatal error (rejected credentials) stops early. After the
    /// last failed attempt the state is [`ConnectionState::Absent`] and
    /// [`BrokerError::Unavailable`] is returned.
    pub async fn acquire_channel(&self) -> Result<Arc<C::Channel>, BrokerError> {
        let mut current = self.current.lock().await;

        if let Some(channel) = current.as_ref() {
            if channel.is_open() {
                return Ok(Arc::clone(channel));
            }
            warn!(backend = self.connector.name(), "Discarding closed channel");
            *current = None;
            self.set_state(ConnectionState::Broken);
        }

        self.set_state(ConnectionState::Connecting);

        let attempts = self.policy.max_attempts;
        for attempt in 1..=attempts {
            match self.open_channel().await {
                Ok(channel) => {
                    let channel = Arc::new(channel);
                    *current = Some(Arc::clone(&channel));
                    self.set_state(ConnectionState::Open);
                    self.metrics.connected();
                    info!(
                        backend = self.connector.name(),
                        queue = %self.queue.name,
                        attempt,
                        "Broker channel open"
                    );
                    return Ok(channel);
                }
                Err(e) if e.category().is_fatal() => {
                    error!(
                        backend = self.connector.name(),
                        error = %e,
                        attempt,
                        "Fatal error while connecting to broker"
                    );
                    self.metrics.connect_failed("fatal");
                    self.set_state(ConnectionState::Absent);
                    return Err(e);
                }
                Err(e) => {
                    self.metrics.connect_failed("transient");
                    warn!(
                        backend = self.connector.name(),
                        error = %e,
                        attempt,
                        max_attempts = attempts,
                        "Broker connection attempt failed"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(self.policy.delay).await;
                    }
                }
            }
        }

        error!(
            backend = self.connector.name(),
            attempts, "Could not establish broker connection"
        );
        self.set_state(ConnectionState::Absent);
        Err(BrokerError::Unavailable { attempts })
    }

    /// Forget `stale` if it is still the current channel.
    ///
    /// Called by users that saw a connection error on a channel. A channel
    /// already replaced by another caller is left alone.
    pub async fn invalidate(&self, stale: &Arc<C::Channel>) {
        let mut current = self.current.lock().await;
        let is_current = current
            .as_ref()
            .is_some_and(|channel| Arc::ptr_eq(channel, stale));

        if is_current {
            if let Some(channel) = current.take() {
                if let Err(e) = channel.close().await {
                    debug!(error = %e, "Ignoring error while closing broken channel");
                }
            }
            self.set_state(ConnectionState::Broken);
            self.metrics.invalidated();
            warn!(backend = self.connector.name(), "Broker channel marked broken");
        }
    }

    /// Close the current channel, if any. Safe to call repeatedly; errors from
    /// an already dead connection are swallowed.
    pub async fn close(&self) {
        let mut current = self.current.lock().await;
        if let Some(channel) = current.take() {
            match channel.close().await {
                Ok(()) => info!(backend = self.connector.name(), "Broker connection closed"),
                Err(e) => debug!(error = %e, "Ignoring error while closing broker connection"),
            }
        }
        self.set_state(ConnectionState::Absent);
    }

    async fn open_channel(&self) -> Result<C::Channel, BrokerError> {
        let channel = self.connector.connect().await?;
        if let Err(e) = channel.declare_queue(&self.queue).await {
            let _ = channel.close().await;
            return Err(e);
        }
        Ok(channel)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(from = %current, to = %state, "Connection state change");
                *current = state;
                true
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use std::time::Duration;

    fn manager(broker: &MemoryBroker, attempts: u32) -> ConnectionManager<MemoryBroker> {
        ConnectionManager::new(
            broker.clone(),
            QueueSpec::durable("tasks"),
            RetryPolicy::new(attempts, Duration::from_secs(5)),
        )
    }

    #[tokio::test]
    async fn test_lazy_connect_and_reuse() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, 3);
        assert_eq!(manager.state(), ConnectionState::Absent);
        assert_eq!(broker.connect_attempts(), 0);

        let first = manager.acquire_channel().await.unwrap();
        let second = manager.acquire_channel().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(manager.state(), ConnectionState::Open);
        assert!(broker.queue_exists("tasks"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_broker_comes_back() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);
        let manager = manager(&broker, 3);

        let started = tokio::time::Instant::now();
        let channel = manager.acquire_channel().await;

        assert!(channel.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let broker = MemoryBroker::new();
        broker.set_down(true);
        let manager = manager(&broker, 5);

        let err = manager.acquire_channel().await.unwrap_err();

        assert!(matches!(err, BrokerError::Unavailable { attempts: 5 }));
        assert_eq!(broker.connect_attempts(), 5);
        assert_eq!(manager.state(), ConnectionState::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_connect_error_stops_retrying() {
        let broker = MemoryBroker::new();
        broker.reject_credentials(true);
        let manager = manager(&broker, 5);

        let err = manager.acquire_channel().await.unwrap_err();

        assert!(matches!(err, BrokerError::Authentication(_)));
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_broken_channel_is_replaced() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, 3);

        let first = manager.acquire_channel().await.unwrap();
        broker.sever_connections();
        assert!(!first.is_open());

        let second = manager.acquire_channel().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.is_open());
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_ignores_replaced_channel() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, 3);

        let stale = manager.acquire_channel().await.unwrap();
        manager.invalidate(&stale).await;
        assert_eq!(manager.state(), ConnectionState::Broken);

        let fresh = manager.acquire_channel().await.unwrap();
        manager.invalidate(&stale).await;

        assert_eq!(manager.state(), ConnectionState::Open);
        let again = manager.acquire_channel().await.unwrap();
        assert!(Arc::ptr_eq(&fresh, &again));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, 3);

        manager.close().await;
        let channel = manager.acquire_channel().await.unwrap();
        manager.close().await;
        manager.close().await;

        assert!(!channel.is_open());
        assert_eq!(manager.state(), ConnectionState::Absent);
    }

    #[tokio::test]
    async fn test_close_swallows_dead_connection_errors() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, 3);

        manager.acquire_channel().await.unwrap();
        broker.sever_connections();
        broker.set_down(true);

        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Absent);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_opens_one_connection() {
        let broker = MemoryBroker::new();
        let manager = Arc::new(manager(&broker, 3));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager.acquire_channel().await.map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(broker.connect_attempts(), 1);
    }
}
