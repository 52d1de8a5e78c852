//! Task Notification Worker (NATS JetStream)
//!
//! Consumes task events from the durable `notification_queue` and turns each
//! one into a notification.
//!
//! ## Architecture
//!
//! ```text
//! NATS JetStream (NOTIFICATION_QUEUE stream)
//!   ↓ (durable pull consumer: notification_queue_workers)
//! Worker<TaskEvent, NotificationProcessor>
//!   ↓
//! NotificationAction (email | log)
//!   ↓
//! SMTP relay (Mailpit/MailHog in development)
//! ```
//!
//! ## Features
//!
//! - Startup grace delay before the first connection
//! - Bounded connection retry, unbounded reconnect once running
//! - Ack on success, requeue on transient failure, drop on malformed input
//! - Graceful shutdown on SIGINT/SIGTERM, in-flight deliveries finish first
//! - Health check endpoints for Kubernetes probes
//! - Prometheus metrics

pub mod config;

use config::{ActionKind, Config};
use core_config::{Environment, FromEnv};
use domain_notifications::providers::SmtpProvider;
use domain_notifications::{
    EmailAction, LogAction, NotificationAction, NotificationProcessor, NotificationQueue,
    TaskEvent,
};
use eyre::{Result, WrapErr};
use messaging::health::{HealthServer, HealthState};
use messaging::{ConnectionManager, Processor, QueueSpec, Worker};
use nats_broker::{NatsBrokerConfig, NatsConnector};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// How often the notification action's downstream is probed for readiness.
const PROCESSOR_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Run the notification worker
///
/// 1. Sets up error reports, structured logging and metrics
/// 2. Starts the health server
/// 3. Picks the notification action (email or log)
/// 4. Runs the worker until SIGINT/SIGTERM or a fatal broker error
///
/// # Errors
///
/// Returns an error if:
/// - Configuration is invalid
/// - The broker is unreachable at startup after all connection attempts
/// - The broker rejects the credentials
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();

    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let metrics_handle =
        messaging::metrics::init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "Starting task notification worker"
    );
    info!("Environment: {:?}", environment);

    let config = Config::from_env().wrap_err("Invalid worker configuration")?;

    let queue = QueueSpec::from_def::<NotificationQueue>();
    let worker_config = config.worker_config(queue.clone());

    info!(
        queue = %worker_config.queue.name,
        consumer = %worker_config.queue.consumer,
        consumer_tag = %worker_config.consumer_tag,
        nats_url = %config.nats.url(),
        connect_attempts = config.retry.max_attempts,
        requeue_delay_secs = config.requeue_delay.as_secs(),
        max_concurrent_deliveries = worker_config.max_concurrent_deliveries,
        "Worker configuration loaded"
    );

    let action = build_action(config.action, &environment)?;
    let processor = NotificationProcessor::with_arc(action);

    // Set up a shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    // Start health server in background
    let health_server = HealthServer::new(config.health_port).with_metrics(metrics_handle);
    let health = health_server.state();
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            error!(error = %e, "Health server failed");
        }
    });

    tokio::spawn(watch_processor_health(
        processor.clone(),
        health.clone(),
        shutdown_rx.clone(),
    ));

    let connector = NatsConnector::new(
        NatsBrokerConfig::from_nats_config(&config.nats).with_nak_delay(config.requeue_delay),
    );
    let connections = Arc::new(ConnectionManager::new(connector, queue, config.retry));

    let worker: Worker<_, TaskEvent, _> =
        Worker::new(connections, processor, worker_config).with_health(health);

    worker
        .run(shutdown_rx)
        .await
        .wrap_err("Notification worker stopped on a broker error")?;

    info!("Task notification worker stopped");
    Ok(())
}

/// Select the notification action.
///
/// Email goes through the SMTP relay from the environment in production and
/// through a local Mailpit/MailHog otherwise.
fn build_action(kind: ActionKind, environment: &Environment) -> Result<Arc<dyn NotificationAction>> {
    match kind {
        ActionKind::Log => {
            info!("Using log-only notification action");
            Ok(Arc::new(LogAction))
        }
        ActionKind::Email if environment.is_production() => {
            info!("Using SMTP provider for production");
            let provider = SmtpProvider::from_env().wrap_err(
                "SMTP configuration error. Ensure SMTP_HOST and EMAIL_FROM_ADDRESS are set",
            )?;
            Ok(Arc::new(EmailAction::new(provider)))
        }
        ActionKind::Email => {
            info!("Using SMTP provider for development (Mailpit/MailHog)");
            let provider = SmtpProvider::mailhog().wrap_err("SMTP configuration error")?;
            Ok(Arc::new(EmailAction::new(provider)))
        }
    }
}

/// Periodically probe the action's downstream and report it to readiness.
///
/// An unhealthy downstream takes the worker out of rotation but never fails
/// liveness.
async fn watch_processor_health(
    processor: NotificationProcessor,
    health: HealthState,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(PROCESSOR_HEALTH_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let healthy = match processor.health_check().await {
                    Ok(healthy) => healthy,
                    Err(e) => {
                        warn!(error = %e, "Processor health check failed");
                        false
                    }
                };
                if !healthy {
                    warn!(action = processor.action_name(), "Notification action is unhealthy");
                }
                health.set_processor_healthy(healthy).await;
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        },
    }
}
