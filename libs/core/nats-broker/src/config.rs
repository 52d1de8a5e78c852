//! Connection and JetStream settings.

use core_config::nats::NatsConfig;
use std::time::Duration;

/// Settings for [`NatsConnector`](crate::NatsConnector).
#[derive(Debug, Clone)]
pub struct NatsBrokerConfig {
    /// Server URL, e.g. `nats://localhost:4222`
    pub url: String,

    /// Optional user/password pair
    pub credentials: Option<(String, String)>,

    /// Client name reported to the server
    pub connection_name: String,

    /// Timeout for a single connection attempt
    pub connect_timeout: Duration,

    /// Server ping interval; a dead peer is detected after a couple of missed pongs
    pub ping_interval: Duration,

    /// How long a delivered message may stay unacked before redelivery
    pub ack_wait: Duration,

    /// Maximum unacked deliveries per consumer
    pub max_ack_pending: i64,

    /// Delay before a requeued (nacked) message is redelivered
    pub nak_delay: Duration,

    /// Stream message limit
    pub max_messages: i64,

    /// Stream retention limit
    pub max_age: Duration,
}

impl Default for NatsBrokerConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            credentials: None,
            connection_name: "notification-pipeline".to_string(),
            connect_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(60),
            ack_wait: Duration::from_secs(60),
            max_ack_pending: 1_000,
            nak_delay: Duration::from_secs(5),
            max_messages: 100_000,
            max_age: Duration::from_secs(7 * 24 * 60 * 60), // 7 days
        }
    }
}

impl NatsBrokerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn from_nats_config(config: &NatsConfig) -> Self {
        Self {
            url: config.url(),
            credentials: config
                .credentials()
                .map(|(user, password)| (user.to_string(), password.to_string())),
            connection_name: config.connection_name.clone(),
            ..Default::default()
        }
    }

    pub fn with_nak_delay(mut self, delay: Duration) -> Self {
        self.nak_delay = delay;
        self
    }
}

/// JetStream stream backing a queue. Stream names may not contain `.`.
pub(crate) fn stream_name(queue: &str) -> String {
    queue.replace('.', "_").to_uppercase()
}
