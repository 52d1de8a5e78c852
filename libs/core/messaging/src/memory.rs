//! In-process broker for tests and local runs without a server.
//!
//! Behaves like a small AMQP-style broker: declared queues, persistent
//! messages, per-tag ack/nack, unacked messages returned to the queue when
//! their channel goes away. Faults can be injected to exercise reconnection.

use crate::channel::{Acker, Channel, Connector, Delivery, DeliveryMode, DeliveryStream};
use crate::config::QueueSpec;
use crate::error::BrokerError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

/// A message sitting in a memory queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub payload: Vec<u8>,
    pub persistent: bool,
    /// Times this message has been handed to a consumer
    pub delivery_count: u64,
}

struct Unacked {
    message: StoredMessage,
    channel_id: u64,
}

#[derive(Default)]
struct MemoryQueue {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
}

impl MemoryQueue {
    /// Put every unacked message of `channel_id` (or all of them) back in
    /// front of the queue, oldest first.
    fn requeue_unacked(&mut self, channel_id: Option<u64>) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| channel_id.is_none_or(|id| u.channel_id == id))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.ready.push_front(unacked.message);
            }
        }
    }
}

#[derive(Default)]
struct BrokerState {
    generation: u64,
    next_channel_id: u64,
    next_tag: u64,
    down: bool,
    reject_credentials: bool,
    failing_connects: u32,
    broken_publishes: u32,
    rejected_publishes: u32,
    connect_attempts: u32,
    publish_attempts: u32,
    queues: HashMap<String, MemoryQueue>,
}

impl BrokerState {
    fn sever(&mut self) {
        self.generation += 1;
        for queue in self.queues.values_mut() {
            queue.requeue_unacked(None);
        }
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

/// In-memory broker. Clones share the same queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock only happens inside a failing test.
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wake(&self) {
        self.shared.notify.notify_waiters();
    }

    /// Refuse (or accept again) new connections. Existing channels stay open.
    pub fn set_down(&self, down: bool) {
        self.lock().down = down;
    }

    /// Fail every connection attempt with an authentication error.
    pub fn reject_credentials(&self, reject: bool) {
        self.lock().reject_credentials = reject;
    }

    /// Fail the next `n` connection attempts with a transient error.
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().failing_connects = n;
    }

    /// Drop every open connection, as a broker restart or network cut would.
    /// Unacked messages go back to their queues.
    pub fn sever_connections(&self) {
        self.lock().sever();
        self.wake();
    }

    /// Restart the broker: connections drop, non-durable queues vanish and
    /// durable queues lose their non-persistent messages.
    pub fn restart(&self) {
        {
            let mut state = self.lock();
            state.sever();
            state.queues.retain(|_, queue| queue.durable);
            for queue in state.queues.values_mut() {
                queue.ready.retain(|message| message.persistent);
            }
        }
        self.wake();
    }

    /// The next publish drops all connections and fails with a connection error.
    pub fn break_on_next_publish(&self) {
        self.break_on_next_publishes(1);
    }

    pub fn break_on_next_publishes(&self, n: u32) {
        self.lock().broken_publishes = n;
    }

    /// The next publish is refused with a non-connection error.
    pub fn reject_next_publish(&self) {
        self.lock().rejected_publishes = 1;
    }

    /// Enqueue raw bytes as if another producer had published them.
    pub fn inject(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        {
            let mut state = self.lock();
            let queue = state
                .queues
                .entry(queue.to_string())
                .or_insert_with(|| MemoryQueue {
                    durable: true,
                    ..Default::default()
                });
            queue.ready.push_back(StoredMessage {
                payload: payload.into(),
                persistent: true,
                delivery_count: 0,
            });
        }
        self.wake();
    }

    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    pub fn publish_attempts(&self) -> u32 {
        self.lock().publish_attempts
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    pub fn is_durable(&self, queue: &str) -> bool {
        self.lock().queues.get(queue).is_some_and(|q| q.durable)
    }

    /// Messages waiting for a consumer.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages handed out but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    /// Snapshot of the messages waiting in `queue`.
    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    type Channel = MemoryChannel;

    async fn connect(&self) -> Result<MemoryChannel, BrokerError> {
        let mut state = self.lock();
        state.connect_attempts += 1;

        if state.reject_credentials {
            return Err(BrokerError::Authentication(
                "ACCESS_REFUSED - login refused".to_string(),
            ));
        }
        if state.down {
            return Err(BrokerError::connection_failed("connection refused"));
        }
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BrokerError::connection_failed("connection refused"));
        }

        state.next_channel_id += 1;
        Ok(MemoryChannel {
            handle: Arc::new(ChannelHandle {
                broker: self.clone(),
                id: state.next_channel_id,
                generation: state.generation,
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct ChannelHandle {
    broker: MemoryBroker,
    id: u64,
    generation: u64,
    closed: AtomicBool,
}

impl ChannelHandle {
    fn check(&self, state: &BrokerState) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else if state.generation != self.generation {
            Err(BrokerError::connection_lost("connection reset by broker"))
        } else {
            Ok(())
        }
    }
}

/// Channel on a [`MemoryBroker`].
pub struct MemoryChannel {
    handle: Arc<ChannelHandle>,
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("id", &self.handle.id)
            .field("generation", &self.handle.generation)
            .field("closed", &self.handle.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError> {
        let mut state = self.handle.broker.lock();
        self.handle.check(&state)?;

        let existing = state
            .queues
            .entry(queue.name.clone())
            .or_insert_with(|| MemoryQueue {
                durable: queue.durable,
                ..Default::default()
            });
        if existing.durable != queue.durable {
            return Err(BrokerError::protocol(format!(
                "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                queue.name
            )));
        }
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        mode: DeliveryMode,
    ) -> Result<(), BrokerError> {
        {
            let mut state = self.handle.broker.lock();
            state.publish_attempts += 1;
            self.handle.check(&state)?;

            if state.broken_publishes > 0 {
                state.broken_publishes -= 1;
                state.sever();
                drop(state);
                self.handle.broker.wake();
                return Err(BrokerError::connection_lost("broken pipe"));
            }
            if state.rejected_publishes > 0 {
                state.rejected_publishes -= 1;
                return Err(BrokerError::protocol("publish rejected by broker"));
            }

            let target = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::protocol(format!("NOT_FOUND - no queue '{}'", queue)))?;
            target.ready.push_back(StoredMessage {
                payload,
                persistent: mode == DeliveryMode::Persistent,
                delivery_count: 0,
            });
        }
        self.handle.broker.wake();
        Ok(())
    }

    async fn consume(&self, queue: &QueueSpec) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        let state = self.handle.broker.lock();
        self.handle.check(&state)?;
        if !state.queues.contains_key(&queue.name) {
            return Err(BrokerError::protocol(format!(
                "NOT_FOUND - no queue '{}'",
                queue.name
            )));
        }
        Ok(Box::new(MemoryDeliveryStream {
            handle: Arc::clone(&self.handle),
            queue: queue.name.clone(),
        }))
    }

    fn is_open(&self) -> bool {
        let state = self.handle.broker.lock();
        self.handle.check(&state).is_ok()
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let result = {
            let mut state = self.handle.broker.lock();
            let result = self.handle.check(&state);
            if self.handle.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            if result.is_ok() {
                for queue in state.queues.values_mut() {
                    queue.requeue_unacked(Some(self.handle.id));
                }
            }
            result
        };
        self.handle.broker.wake();
        result
    }
}

struct MemoryDeliveryStream {
    handle: Arc<ChannelHandle>,
    queue: String,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next(&mut self) -> Option<Result<Delivery, BrokerError>> {
        loop {
            let notified = self.handle.broker.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.handle.broker.lock();
                match self.handle.check(&state) {
                    Err(BrokerError::Closed) => return None,
                    Err(e) => return Some(Err(e)),
                    Ok(()) => {}
                }

                state.next_tag += 1;
                let tag = state.next_tag;
                let Some(queue) = state.queues.get_mut(&self.queue) else {
                    return Some(Err(BrokerError::connection_lost("queue deleted")));
                };

                if let Some(mut message) = queue.ready.pop_front() {
                    message.delivery_count += 1;
                    let delivery = Delivery::new(
                        tag,
                        message.payload.clone(),
                        message.delivery_count,
                        MemoryAcker {
                            handle: Arc::clone(&self.handle),
                            queue: self.queue.clone(),
                            tag,
                        },
                    );
                    queue.unacked.insert(
                        tag,
                        Unacked {
                            message,
                            channel_id: self.handle.id,
                        },
                    );
                    return Some(Ok(delivery));
                }
            }

            notified.await;
        }
    }
}

struct MemoryAcker {
    handle: Arc<ChannelHandle>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: bool) -> Result<(), BrokerError> {
        let mut state = self.handle.broker.lock();
        self.handle.check(&state)?;

        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::connection_lost("queue deleted"))?;
        let unacked = queue.unacked.remove(&self.tag).ok_or_else(|| {
            BrokerError::protocol(format!("PRECONDITION_FAILED - unknown delivery tag {}", self.tag))
        })?;
        if requeue {
            queue.ready.push_back(unacked.message);
        }
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle(false)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle(requeue)?;
        if requeue {
            self.handle.broker.wake();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(broker: &MemoryBroker, queue: &QueueSpec) -> MemoryChannel {
        let channel = broker.connect().await.unwrap();
        channel.declare_queue(queue).await.unwrap();
        channel
    }

    #[tokio::test]
    async fn test_publish_then_consume_and_ack() {
        let broker = MemoryBroker::new();
        let queue = QueueSpec::durable("q");
        let channel = open(&broker, &queue).await;

        channel
            .publish("q", b"hello".to_vec(), DeliveryMode::Persistent)
            .await
            .unwrap();
        let mut stream = channel.consume(&queue).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();

        assert_eq!(delivery.payload(), b"hello");
        assert_eq!(delivery.delivery_count(), 1);
        assert_eq!(broker.unacked_count("q"), 1);

        delivery.ack().await.unwrap();
        assert_eq!(broker.unacked_count("q"), 0);
        assert_eq!(broker.queue_depth("q"), 0);
    }

    #[tokio::test]
    async fn test_nack_with_requeue_redelivers() {
        let broker = MemoryBroker::new();
        let queue = QueueSpec::durable("q");
        let channel = open(&broker, &queue).await;
        broker.inject("q", "x");

        let mut stream = channel.consume(&queue).await.unwrap();
        stream.next().await.unwrap().unwrap().nack(true).await.unwrap();
        let again = stream.next().await.unwrap().unwrap();

        assert!(again.is_redelivered());
        assert_eq!(again.delivery_count(), 2);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_discards() {
        let broker = MemoryBroker::new();
        let queue = QueueSpec::durable("q");
        let channel = open(&broker, &queue).await;
        broker.inject("q", "x");

        let mut stream = channel.consume(&queue).await.unwrap();
        stream.next().await.unwrap().unwrap().nack(false).await.unwrap();

        assert_eq!(broker.queue_depth("q"), 0);
        assert_eq!(broker.unacked_count("q"), 0);
    }

    #[tokio::test]
    async fn test_sever_requeues_unacked_and_fails_ack() {
        let broker = MemoryBroker::new();
        let queue = QueueSpec::durable("q");
        let channel = open(&broker, &queue).await;
        broker.inject("q", "x");

        let mut stream = channel.consume(&queue).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        broker.sever_connections();

        assert!(!channel.is_open());
        assert_eq!(broker.queue_depth("q"), 1);
        let err = delivery.ack().await.unwrap_err();
        assert!(err.category().is_transient());
        assert!(matches!(stream.next().await, Some(Err(_))));
    }

    #[tokio::test]
    async fn test_close_requeues_own_unacked_and_ends_stream() {
        let broker = MemoryBroker::new();
        let queue = QueueSpec::durable("q");
        let channel = open(&broker, &queue).await;
        broker.inject("q", "x");

        let mut stream = channel.consume(&queue).await.unwrap();
        let _delivery = stream.next().await.unwrap().unwrap();
        channel.close().await.unwrap();

        assert_eq!(broker.queue_depth("q"), 1);
        assert!(stream.next().await.is_none());
        assert!(channel.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_restart_keeps_only_durable_persistent_messages() {
        let broker = MemoryBroker::new();
        let durable = QueueSpec::durable("keep");
        let scratch = QueueSpec {
            durable: false,
            ..QueueSpec::durable("scratch")
        };
        let channel = open(&broker, &durable).await;
        channel.declare_queue(&scratch).await.unwrap();

        channel
            .publish("keep", b"p".to_vec(), DeliveryMode::Persistent)
            .await
            .unwrap();
        channel
            .publish("keep", b"t".to_vec(), DeliveryMode::Transient)
            .await
            .unwrap();
        channel
            .publish("scratch", b"s".to_vec(), DeliveryMode::Persistent)
            .await
            .unwrap();

        broker.restart();

        assert_eq!(broker.messages("keep").len(), 1);
        assert_eq!(broker.messages("keep")[0].payload, b"p".to_vec());
        assert!(!broker.queue_exists("scratch"));
    }

    #[tokio::test]
    async fn test_redeclare_with_different_durability_fails() {
        let broker = MemoryBroker::new();
        let channel = open(&broker, &QueueSpec::durable("q")).await;

        let transient = QueueSpec {
            durable: false,
            ..QueueSpec::durable("q")
        };
        let err = channel.declare_queue(&transient).await.unwrap_err();
        assert!(err.category().is_fatal());
    }

    #[tokio::test]
    async fn test_consumer_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let queue = QueueSpec::durable("q");
        let channel = open(&broker, &queue).await;
        let mut stream = channel.consume(&queue).await.unwrap();

        let waiter = tokio::spawn(async move { stream.next().await.map(|d| d.map(|d| d.tag())) });
        tokio::task::yield_now().await;
        broker.inject("q", "late");

        let tag = waiter.await.unwrap().unwrap().unwrap();
        assert!(tag > 0);
    }
}
