//! Task Notification Worker (NATS JetStream)
//!
//! Binary entry point for the notification worker.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_notification_worker::run().await
}
