//! Long-running consumer: receive, dispatch, settle, reconnect.

use crate::channel::{Channel, Connector, Delivery};
use crate::config::WorkerConfig;
use crate::connection::ConnectionManager;
use crate::error::BrokerError;
use crate::health::HealthState;
use crate::metrics::WorkerMetrics;
use crate::processor::Processor;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Payload bytes included in the log line of a dropped message.
const PAYLOAD_PREVIEW_BYTES: usize = 256;

/// Consumes a queue and hands each message to a [`Processor`].
///
/// Settlement per delivery:
/// - payload does not deserialize into `M`: ack (poison message)
/// - processor succeeds: ack
/// - processor fails transiently: nack with requeue
/// - processor fails permanently: ack
///
/// A dropped connection is discarded and re-established after
/// `reconnect_delay`. Only fatal broker errors, or failing to connect at
/// startup, stop the worker.
pub struct Worker<C, M, P>
where
    C: Connector,
    M: DeserializeOwned + Send + Sync + 'static,
    P: Processor<M>,
{
    connections: Arc<ConnectionManager<C>>,
    processor: Arc<P>,
    config: WorkerConfig,
    metrics: WorkerMetrics,
    health: Option<HealthState>,
    _message: PhantomData<fn() -> M>,
}

impl<C, M, P> Worker<C, M, P>
where
    C: Connector,
    M: DeserializeOwned + Send + Sync + 'static,
    P: Processor<M>,
{
    pub fn new(connections: Arc<ConnectionManager<C>>, processor: P, config: WorkerConfig) -> Self {
        let metrics = WorkerMetrics::new(&config.queue.name, processor.name());
        Self {
            connections,
            processor: Arc::new(processor),
            config,
            metrics,
            health: None,
            _message: PhantomData,
        }
    }

    /// Report connection status and fatal errors to a health server.
    pub fn with_health(mut self, health: HealthState) -> Self {
        self.health = Some(health);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run until `shutdown` flips to `true` or a fatal error occurs.
    ///
    /// On shutdown, stops fetching, waits for in-flight deliveries to settle
    /// and closes the connection.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), BrokerError> {
        info!(
            queue = %self.config.queue.name,
            consumer_tag = %self.config.consumer_tag,
            processor = self.processor.name(),
            max_concurrent_deliveries = self.config.max_concurrent_deliveries,
            "Starting worker"
        );

        if !self.config.startup_delay.is_zero() {
            info!(delay = ?self.config.startup_delay, "Waiting for broker before first connection");
            if wait_or_shutdown(&mut shutdown, self.config.startup_delay).await {
                info!("Shutdown requested before worker connected");
                return Ok(());
            }
        }

        let mut channel = match self.connections.acquire_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                error!(error = %e, "Could not establish broker connection, worker exiting");
                self.report_fatal(&e).await;
                return Err(e);
            }
        };

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_deliveries));
        let mut in_flight = JoinSet::new();

        let result = loop {
            self.report_connected(true).await;

            match self
                .consume(&channel, &mut shutdown, &semaphore, &mut in_flight)
                .await
            {
                Ok(()) => break Ok(()),
                Err(e) if e.category().is_fatal() => {
                    error!(error = %e, "Fatal broker error, worker exiting");
                    self.report_fatal(&e).await;
                    break Err(e);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        delay = ?self.config.reconnect_delay,
                        "Broker connection lost, reconnecting"
                    );
                    self.report_connected(false).await;
                    self.connections.invalidate(&channel).await;
                    self.metrics.reconnected();

                    match self.reconnect(&mut shutdown).await {
                        Ok(Some(fresh)) => channel = fresh,
                        Ok(None) => break Ok(()),
                        Err(e) => {
                            self.report_fatal(&e).await;
                            break Err(e);
                        }
                    }
                }
            }
        };

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "Waiting for in-flight deliveries");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Delivery task panicked");
            }
        }

        self.connections.close().await;
        self.report_connected(false).await;
        info!(queue = %self.config.queue.name, "Worker stopped");
        result
    }

    /// Receive until shutdown (`Ok`) or a broker error (`Err`).
    async fn consume(
        &self,
        channel: &Arc<C::Channel>,
        shutdown: &mut watch::Receiver<bool>,
        semaphore: &Arc<Semaphore>,
        in_flight: &mut JoinSet<()>,
    ) -> Result<(), BrokerError> {
        let mut deliveries = channel.consume(&self.config.queue).await?;
        info!(queue = %self.config.queue.name, "Waiting for messages");

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Delivery task panicked");
                }
            }

            if *shutdown.borrow() {
                return Ok(());
            }

            let permit = if self.config.is_sequential() {
                None
            } else {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                        continue;
                    }
                    permit = Arc::clone(semaphore).acquire_owned() => {
                        Some(permit.map_err(|_| BrokerError::Closed)?)
                    }
                }
            };

            let next = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    continue;
                }
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => return Err(e),
                None => return Err(BrokerError::connection_lost("consumer stream ended")),
            };

            match permit {
                None => {
                    let settled = handle_delivery::<M, P>(
                        Arc::clone(&self.processor),
                        self.metrics.clone(),
                        delivery,
                    )
                    .await;
                    if let Err(e) = settled {
                        if e.is_connection_error() {
                            return Err(e);
                        }
                        warn!(error = %e, "Failed to settle delivery");
                    }
                }
                Some(permit) => {
                    let processor = Arc::clone(&self.processor);
                    let metrics = self.metrics.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        if let Err(e) = handle_delivery::<M, P>(processor, metrics, delivery).await {
                            warn!(error = %e, "Failed to settle delivery");
                        }
                    });
                }
            }
        }
    }

    /// Re-enter connection establishment until it succeeds.
    ///
    /// Exhausting one round of bounded retries is logged and followed by
    /// another round. Returns `Ok(None)` on shutdown.
    async fn reconnect(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Option<Arc<C::Channel>>, BrokerError> {
        loop {
            if wait_or_shutdown(shutdown, self.config.reconnect_delay).await {
                return Ok(None);
            }
            match self.connections.acquire_channel().await {
                Ok(channel) => {
                    info!(queue = %self.config.queue.name, "Worker reconnected");
                    return Ok(Some(channel));
                }
                Err(e) if e.category().is_fatal() => {
                    error!(error = %e, "Fatal error while reconnecting, worker exiting");
                    return Err(e);
                }
                Err(e) => {
                    error!(error = %e, "Broker still unavailable, will keep retrying");
                }
            }
        }
    }

    async fn report_connected(&self, connected: bool) {
        if let Some(health) = &self.health {
            health.set_broker_connected(connected).await;
        }
    }

    async fn report_fatal(&self, error: &BrokerError) {
        if let Some(health) = &self.health {
            health.set_fatal(error.to_string()).await;
        }
    }
}

/// Deserialize, process and settle one delivery.
///
/// Returns the settlement error, if any. A failed ack or nack leaves the
/// message unacked, so the broker redelivers it later.
#[instrument(
    skip_all,
    fields(
        processor = processor.name(),
        delivery_tag = delivery.tag(),
        delivery_count = delivery.delivery_count()
    )
)]
async fn handle_delivery<M, P>(
    processor: Arc<P>,
    metrics: WorkerMetrics,
    delivery: Delivery,
) -> Result<(), BrokerError>
where
    M: DeserializeOwned + Send + Sync + 'static,
    P: Processor<M>,
{
    metrics.received();
    let started = Instant::now();

    let message: M = match serde_json::from_slice(delivery.payload()) {
        Ok(message) => message,
        Err(e) => {
            warn!(
                error = %e,
                payload = %preview(delivery.payload()),
                "Dropping malformed message"
            );
            delivery.ack().await?;
            metrics.dropped("malformed");
            return Ok(());
        }
    };

    match processor.process(&message).await {
        Ok(()) => {
            delivery.ack().await?;
            metrics.acked(started.elapsed());
            debug!(elapsed = ?started.elapsed(), "Message processed");
        }
        Err(e) if e.should_requeue() => {
            warn!(error = %e, "Processing failed, requeueing message");
            delivery.nack(true).await?;
            metrics.requeued();
        }
        Err(e) => {
            error!(error = %e, "Processing failed permanently, dropping message");
            delivery.ack().await?;
            metrics.dropped("permanent");
        }
    }
    Ok(())
}

fn preview(payload: &[u8]) -> String {
    let end = payload.len().min(PAYLOAD_PREVIEW_BYTES);
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

/// Sleep for `delay` unless shutdown is requested first. Returns `true` on shutdown.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueSpec, RetryPolicy};
    use crate::connection::ConnectionState;
    use crate::error::ProcessingError;
    use crate::memory::MemoryBroker;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const QUEUE: &str = "jobs";

    #[derive(Debug, Serialize, Deserialize)]
    struct Job {
        id: u32,
    }

    /// Records every call; fails ids in `transient` a given number of times
    /// and ids in `permanent` always.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<u32>>,
        transient: Mutex<HashMap<u32, u32>>,
        permanent: Vec<u32>,
        work: Duration,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Recorder {
        fn failing_transiently(id: u32, times: u32) -> Self {
            let recorder = Self::default();
            recorder.transient.lock().unwrap().insert(id, times);
            recorder
        }

        fn calls(&self) -> Vec<u32> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Processor<Job> for Arc<Recorder> {
        async fn process(&self, job: &Job) -> Result<(), ProcessingError> {
            self.calls.lock().unwrap().push(job.id);
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            if !self.work.is_zero() {
                tokio::time::sleep(self.work).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);

            if self.permanent.contains(&job.id) {
                return Err(ProcessingError::permanent("unsupported job"));
            }
            let mut transient = self.transient.lock().unwrap();
            if let Some(remaining) = transient.get_mut(&job.id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ProcessingError::transient("downstream unavailable"));
                }
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recorder"
        }
    }

    struct Harness {
        broker: MemoryBroker,
        connections: Arc<ConnectionManager<MemoryBroker>>,
        shutdown: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<Result<(), BrokerError>>,
    }

    fn config() -> WorkerConfig {
        WorkerConfig::new(QueueSpec::durable(QUEUE))
            .with_startup_delay(Duration::ZERO)
            .with_reconnect_delay(Duration::from_secs(5))
    }

    fn start(broker: &MemoryBroker, recorder: Arc<Recorder>, config: WorkerConfig) -> Harness {
        let connections = Arc::new(ConnectionManager::new(
            broker.clone(),
            config.queue.clone(),
            RetryPolicy::new(2, Duration::from_secs(5)),
        ));
        let worker = Worker::new(Arc::clone(&connections), recorder, config);
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });
        Harness {
            broker: broker.clone(),
            connections,
            shutdown,
            handle,
        }
    }

    impl Harness {
        async fn stop(self) -> Result<(), BrokerError> {
            self.shutdown.send(true).unwrap();
            self.handle.await.unwrap()
        }

        async fn settled(&self) {
            wait_until(|| {
                self.broker.queue_depth(QUEUE) == 0 && self.broker.unacked_count(QUEUE) == 0
            })
            .await;
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..2_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn publish(broker: &MemoryBroker, id: u32) {
        broker.inject(QUEUE, serde_json::to_vec(&Job { id }).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_processes_and_acks_each_message_once() {
        let broker = MemoryBroker::new();
        let recorder = Arc::new(Recorder::default());
        for id in 1..=3 {
            publish(&broker, id);
        }

        let harness = start(&broker, Arc::clone(&recorder), config());
        wait_until(|| recorder.calls().len() == 3).await;
        harness.settled().await;

        assert_eq!(recorder.calls(), vec![1, 2, 3]);
        harness.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_redelivered_until_acked() {
        let broker = MemoryBroker::new();
        let recorder = Arc::new(Recorder::failing_transiently(7, 2));
        publish(&broker, 7);

        let harness = start(&broker, Arc::clone(&recorder), config());
        wait_until(|| recorder.calls().len() == 3).await;
        harness.settled().await;

        assert_eq!(recorder.calls(), vec![7, 7, 7]);
        harness.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_payload_is_acked_and_not_redelivered() {
        let broker = MemoryBroker::new();
        let recorder = Arc::new(Recorder::default());
        broker.inject(QUEUE, "not json at all");
        broker.inject(QUEUE, r#"{"unexpected": true}"#);
        publish(&broker, 1);

        let harness = start(&broker, Arc::clone(&recorder), config());
        wait_until(|| recorder.calls().len() == 1).await;
        harness.settled().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(recorder.calls(), vec![1]);
        harness.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_dropped() {
        let broker = MemoryBroker::new();
        let recorder = Arc::new(Recorder {
            permanent: vec![4],
            ..Default::default()
        });
        publish(&broker, 4);

        let harness = start(&broker, Arc::clone(&recorder), config());
        harness.settled().await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(recorder.calls(), vec![4]);
        harness.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_connection_drop() {
        let broker = MemoryBroker::new();
        let recorder = Arc::new(Recorder::default());
        publish(&broker, 1);

        let harness = start(&broker, Arc::clone(&recorder), config());
        wait_until(|| recorder.calls().len() == 1).await;
        harness.settled().await;

        broker.sever_connections();
        publish(&broker, 2);
        wait_until(|| recorder.calls().len() == 2).await;
        harness.settled().await;

        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(harness.connections.state(), ConnectionState::Open);
        harness.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_reconnecting_while_broker_is_down() {
        let broker = MemoryBroker::new();
        let recorder = Arc::new(Recorder::default());

        let harness = start(&broker, Arc::clone(&recorder), config());
        wait_until(|| harness.connections.state() == ConnectionState::Open).await;

        broker.set_down(true);
        broker.sever_connections();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!harness.handle.is_finished());

        broker.set_down(false);
        publish(&broker, 9);
        wait_until(|| recorder.calls() == vec![9]).await;
        harness.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_connection_failure_is_fatal() {
        let broker = MemoryBroker::new();
        broker.set_down(true);

        let harness = start(&broker, Arc::new(Recorder::default()), config());
        let result = harness.handle.await.unwrap();

        assert!(matches!(result, Err(BrokerError::Unavailable { attempts: 2 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_while_reconnecting_stops_worker() {
        let broker = MemoryBroker::new();
        let harness = start(&broker, Arc::new(Recorder::default()), config());
        wait_until(|| harness.connections.state() == ConnectionState::Open).await;

        broker.reject_credentials(true);
        broker.sever_connections();
        let result = harness.handle.await.unwrap();

        assert!(matches!(result, Err(BrokerError::Authentication(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_fails_liveness() {
        let broker = MemoryBroker::new();
        broker.reject_credentials(true);
        let health = HealthState::new();
        let connections = Arc::new(ConnectionManager::new(
            broker.clone(),
            QueueSpec::durable(QUEUE),
            RetryPolicy::no_retry(),
        ));
        let worker: Worker<_, Job, _> = Worker::new(
            connections,
            Arc::new(Recorder::default()),
            config(),
        )
        .with_health(health.clone());
        let (_shutdown, rx) = watch::channel(false);

        assert!(worker.run(rx).await.is_err());
        assert!(!health.is_alive().await);
        assert_eq!(health.status().await.status, "failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_delay_defers_first_connection() {
        let broker = MemoryBroker::new();
        let harness = start(
            &broker,
            Arc::new(Recorder::default()),
            config().with_startup_delay(Duration::from_secs(30)),
        );

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(broker.connect_attempts(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(broker.connect_attempts(), 1);
        harness.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_mode_processes_one_at_a_time() {
        let broker = MemoryBroker::new();
        let recorder = Arc::new(Recorder {
            work: Duration::from_millis(100),
            ..Default::default()
        });
        for id in 1..=4 {
            publish(&broker, id);
        }

        let harness = start(&broker, Arc::clone(&recorder), config());
        wait_until(|| recorder.calls().len() == 4).await;
        harness.settled().await;

        assert_eq!(recorder.peak.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.calls(), vec![1, 2, 3, 4]);
        harness.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_deliveries_settle_independently() {
        let broker = MemoryBroker::new();
        let recorder = Arc::new(Recorder {
            work: Duration::from_millis(100),
            permanent: vec![3],
            ..Recorder::failing_transiently(2, 1)
        });
        for id in 1..=4 {
            publish(&broker, id);
        }

        let harness = start(
            &broker,
            Arc::clone(&recorder),
            config().with_max_concurrent_deliveries(4),
        );
        wait_until(|| recorder.calls().len() == 5).await;
        harness.settled().await;

        let mut calls = recorder.calls();
        calls.sort_unstable();
        assert_eq!(calls, vec![1, 2, 2, 3, 4]);
        assert_eq!(recorder.peak.load(Ordering::SeqCst), 4);
        harness.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_delivery() {
        let broker = MemoryBroker::new();
        let recorder = Arc::new(Recorder {
            work: Duration::from_secs(3),
            ..Default::default()
        });
        publish(&broker, 1);

        let harness = start(
            &broker,
            Arc::clone(&recorder),
            config().with_max_concurrent_deliveries(2),
        );
        wait_until(|| recorder.calls().len() == 1).await;

        let connections = Arc::clone(&harness.connections);
        harness.stop().await.unwrap();

        assert_eq!(broker.unacked_count(QUEUE), 0);
        assert_eq!(broker.queue_depth(QUEUE), 0);
        assert_eq!(connections.state(), ConnectionState::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_reports_connection() {
        let broker = MemoryBroker::new();
        let health = HealthState::new();
        let connections = Arc::new(ConnectionManager::new(
            broker.clone(),
            QueueSpec::durable(QUEUE),
            RetryPolicy::no_retry(),
        ));
        let worker = Worker::new(
            Arc::clone(&connections),
            Arc::new(Recorder::default()),
            config(),
        )
        .with_health(health.clone());
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { worker.run(rx).await });

        wait_until(|| connections.state() == ConnectionState::Open).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(health.is_ready().await);

        shutdown.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert!(!health.is_ready().await);
        assert!(health.is_alive().await);
    }

    #[test]
    fn test_preview_truncates_payload() {
        let payload = vec![b'a'; 1_000];
        assert_eq!(preview(&payload).len(), PAYLOAD_PREVIEW_BYTES);
        assert_eq!(preview(b"short"), "short");
    }
}
