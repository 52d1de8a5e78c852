//! Worker settings loaded from the environment.

use core_config::nats::NatsConfig;
use core_config::{env_parse, ConfigError, FromEnv};
use messaging::{RetryPolicy, WorkerConfig};
use std::str::FromStr;
use std::time::Duration;

/// Which notification action the worker runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    /// Send an email to the event's recipient
    Email,
    /// Log the rendered message only
    Log,
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "email" => Ok(ActionKind::Email),
            "log" => Ok(ActionKind::Log),
            other => Err(format!("unknown notification action '{}', expected email or log", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub nats: NatsConfig,
    /// Bounded retry for each connection establishment
    pub retry: RetryPolicy,
    /// Grace period before the first connection
    pub startup_delay: Duration,
    /// Pause after a dropped connection before reconnecting
    pub reconnect_delay: Duration,
    /// Delay before a requeued delivery comes back
    pub requeue_delay: Duration,
    pub max_concurrent_deliveries: usize,
    /// Fixed consumer tag; a unique one is generated when unset
    pub consumer_tag: Option<String>,
    pub health_port: u16,
    pub action: ActionKind,
}

impl Config {
    /// Worker configuration for `queue` with these settings applied.
    pub fn worker_config(&self, queue: messaging::QueueSpec) -> WorkerConfig {
        let config = WorkerConfig::new(queue)
            .with_startup_delay(self.startup_delay)
            .with_reconnect_delay(self.reconnect_delay)
            .with_max_concurrent_deliveries(self.max_concurrent_deliveries);

        match &self.consumer_tag {
            Some(tag) => config.with_consumer_tag(tag.clone()),
            None => config,
        }
    }
}

impl FromEnv for Config {
    /// - NATS_*: see [`NatsConfig`]
    /// - WORKER_CONNECT_ATTEMPTS (default 5), WORKER_CONNECT_DELAY_SECS (default 5)
    /// - WORKER_STARTUP_DELAY_SECS (default 30)
    /// - WORKER_RECONNECT_DELAY_SECS (default 5)
    /// - WORKER_REQUEUE_DELAY_SECS (default 5, 0 = redeliver immediately)
    /// - MAX_CONCURRENT_DELIVERIES (default 10, 1 = strictly sequential)
    /// - WORKER_CONSUMER_TAG (optional)
    /// - HEALTH_PORT (default 8081)
    /// - NOTIFICATION_ACTION: email (default) or log
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = RetryPolicy::consumer();
        let retry = RetryPolicy::new(
            env_parse("WORKER_CONNECT_ATTEMPTS", defaults.max_attempts)?,
            Duration::from_secs(env_parse("WORKER_CONNECT_DELAY_SECS", defaults.delay.as_secs())?),
        );

        Ok(Self {
            nats: NatsConfig::from_env()?,
            retry,
            startup_delay: Duration::from_secs(env_parse("WORKER_STARTUP_DELAY_SECS", 30)?),
            reconnect_delay: Duration::from_secs(env_parse("WORKER_RECONNECT_DELAY_SECS", 5)?),
            requeue_delay: Duration::from_secs(env_parse("WORKER_REQUEUE_DELAY_SECS", 5)?),
            max_concurrent_deliveries: env_parse("MAX_CONCURRENT_DELIVERIES", 10)?,
            consumer_tag: std::env::var("WORKER_CONSUMER_TAG").ok().filter(|v| !v.is_empty()),
            health_port: env_parse("HEALTH_PORT", 8081)?,
            action: env_parse("NOTIFICATION_ACTION", ActionKind::Email)?,
        })
    }
}
