//! Connector and channel over a NATS client with JetStream.

use crate::config::{stream_name, NatsBrokerConfig};
use crate::error::{from_connect_error, from_jetstream_error};
use crate::stream::NatsDeliveryStream;
use async_nats::connection::State;
use async_nats::jetstream::consumer::pull::Config as ConsumerConfig;
use async_nats::jetstream::consumer::AckPolicy;
use async_nats::jetstream::stream::{Config as StreamConfig, RetentionPolicy, StorageType};
use async_nats::jetstream::Context;
use async_trait::async_trait;
use messaging::{BrokerError, Channel, Connector, DeliveryMode, DeliveryStream, QueueSpec};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Opens NATS connections.
#[derive(Debug, Clone)]
pub struct NatsConnector {
    config: NatsBrokerConfig,
}

impl NatsConnector {
    pub fn new(config: NatsBrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for NatsConnector {
    type Channel = NatsChannel;

    async fn connect(&self) -> Result<NatsChannel, BrokerError> {
        let mut options = async_nats::ConnectOptions::new()
            .name(&self.config.connection_name)
            .connection_timeout(self.config.connect_timeout)
            .ping_interval(self.config.ping_interval);

        if let Some((user, password)) = &self.config.credentials {
            options = options.user_and_password(user.clone(), password.clone());
        }

        debug!(url = %self.config.url, "Connecting to NATS");
        let client = options
            .connect(self.config.url.as_str())
            .await
            .map_err(from_connect_error)?;

        Ok(NatsChannel {
            jetstream: async_nats::jetstream::new(client.clone()),
            client,
            config: self.config.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn name(&self) -> &'static str {
        "nats"
    }
}

/// A NATS connection plus its JetStream context.
///
/// A queue is a work-queue stream with a single subject equal to the queue
/// name; consumers are durable pull consumers with explicit ack.
pub struct NatsChannel {
    client: async_nats::Client,
    jetstream: Context,
    config: NatsBrokerConfig,
    closed: AtomicBool,
}

impl NatsChannel {
    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

#[async_trait]
impl Channel for NatsChannel {
    async fn declare_queue(&self, queue: &QueueSpec) -> Result<(), BrokerError> {
        let name = stream_name(&queue.name);
        let storage = if queue.durable {
            StorageType::File
        } else {
            StorageType::Memory
        };

        let mut stream = self
            .jetstream
            .get_or_create_stream(StreamConfig {
                name: name.clone(),
                subjects: vec![queue.name.clone()],
                retention: RetentionPolicy::WorkQueue,
                storage,
                max_messages: self.config.max_messages,
                max_age: self.config.max_age,
                ..Default::default()
            })
            .await
            .map_err(from_jetstream_error)?;

        let info = stream.info().await.map_err(from_jetstream_error)?;
        info!(
            stream = %name,
            subject = %queue.name,
            messages = info.state.messages,
            "Queue declared"
        );
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        mode: DeliveryMode,
    ) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        // Persistence comes from the stream's storage type; awaiting the
        // PubAck means the server has stored the message.
        let ack = self
            .jetstream
            .publish(queue.to_string(), payload.into())
            .await
            .map_err(from_jetstream_error)?
            .await
            .map_err(from_jetstream_error)?;

        debug!(
            stream = %ack.stream,
            sequence = ack.sequence,
            persistent = mode == DeliveryMode::Persistent,
            "Published message"
        );
        Ok(())
    }

    async fn consume(&self, queue: &QueueSpec) -> Result<Box<dyn DeliveryStream>, BrokerError> {
        let stream = self
            .jetstream
            .get_stream(stream_name(&queue.name))
            .await
            .map_err(from_jetstream_error)?;

        let consumer = stream
            .get_or_create_consumer(
                &queue.consumer,
                ConsumerConfig {
                    durable_name: Some(queue.consumer.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.config.ack_wait,
                    max_ack_pending: self.config.max_ack_pending,
                    filter_subject: queue.name.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(from_jetstream_error)?;

        let messages = consumer.messages().await.map_err(from_jetstream_error)?;

        info!(consumer = %queue.consumer, subject = %queue.name, "Consumer attached");
        Ok(Box::new(NatsDeliveryStream::new(messages, self.config.nak_delay)))
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && matches!(self.client.connection_state(), State::Connected)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Drain flushes pending publishes, then closes the connection for
        // every clone of the client.
        self.client
            .drain()
            .await
            .map_err(|e| BrokerError::connection_lost(e.to_string()))
    }
}
