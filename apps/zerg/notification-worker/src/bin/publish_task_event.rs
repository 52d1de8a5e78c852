//! Publish a single task event to the notification queue.
//!
//! Goes through the same `TaskEventPublisher` the task service uses, so the
//! reconnect-once and log-and-drop behavior can be checked by hand.
//!
//! ```text
//! cargo run -p zerg_notification_worker --bin publish-task-event -- create "Write report" --email a@b.com
//! cargo run -p zerg_notification_worker --bin publish-task-event -- delete 42
//! ```

use clap::Parser;
use core_config::nats::NatsConfig;
use core_config::{env_parse, Environment, FromEnv};
use domain_notifications::{
    NotificationQueue, Operation, PublisherConfig, TaskEvent, TaskEventPublisher, TaskRef,
};
use eyre::{Result, WrapErr};
use messaging::{ConnectionManager, PublishOutcome, QueueSpec, RetryPolicy};
use nats_broker::{NatsBrokerConfig, NatsConnector};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "publish-task-event")]
#[command(about = "Publish one task event to the notification queue")]
struct Cli {
    /// Task operation (create, update, delete, complete)
    operation: Operation,

    /// Task title, or the numeric task id for delete
    task: String,

    /// Recipient of the notification email
    #[arg(short, long)]
    email: Option<String>,
}

impl Cli {
    fn event(self) -> TaskEvent {
        let task = match (self.operation, self.task.parse::<i64>()) {
            (Operation::Delete, Ok(id)) => TaskRef::Id(id),
            _ => TaskRef::Title(self.task),
        };
        TaskEvent::new(self.operation, task, self.email)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    core_config::tracing::install_color_eyre();
    core_config::tracing::init_tracing(&Environment::from_env());

    let cli = Cli::parse();
    let event = cli.event();

    let nats = NatsConfig::from_env().wrap_err("Invalid NATS configuration")?;
    let defaults = RetryPolicy::publisher();
    let retry = RetryPolicy::new(
        env_parse("PUBLISHER_CONNECT_ATTEMPTS", defaults.max_attempts)?,
        Duration::from_secs(env_parse("PUBLISHER_CONNECT_DELAY_SECS", defaults.delay.as_secs())?),
    );

    let connections = Arc::new(ConnectionManager::new(
        NatsConnector::new(NatsBrokerConfig::from_nats_config(&nats)),
        QueueSpec::from_def::<NotificationQueue>(),
        retry,
    ));
    let publisher = TaskEventPublisher::new(
        Arc::clone(&connections),
        PublisherConfig::from_env()?,
    );

    info!(url = %nats.url(), message = %event.message(), "Publishing task event");
    let outcome = publisher.publish(&event).await;
    connections.close().await;

    match outcome {
        PublishOutcome::Dropped => eyre::bail!("Event was not published, see the log for the cause"),
        outcome => {
            info!(?outcome, "Event published");
            Ok(())
        }
    }
}
