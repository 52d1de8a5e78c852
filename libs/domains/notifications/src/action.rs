//! Notification actions: what happens to a task event once it is consumed.

use crate::models::TaskEvent;
use crate::providers::{EmailContent, EmailProvider};
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Subject line of every notification email.
pub const EMAIL_SUBJECT: &str = "Task Manager Notification";

/// First line of every notification email body.
pub const EMAIL_PREAMBLE: &str = "This message is sent from task manager.";

/// Result of a notification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Transport failure. The event is eligible for redelivery.
    Failed(String),
    /// The event can never be delivered, e.g. the recipient is not a valid
    /// address. Redelivery would fail the same way.
    Rejected(String),
}

/// Renders a task event and delivers it somewhere.
///
/// Implementations must not retry internally; a `Failed` outcome is retried
/// through broker redelivery, so the same event may be notified twice.
/// `Rejected` is final.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationAction: Send + Sync {
    async fn notify(&self, event: &TaskEvent) -> DeliveryOutcome;

    fn name(&self) -> &'static str;

    async fn health_check(&self) -> bool {
        true
    }
}

/// Sends the rendered message by email to the event's recipient.
///
/// Events without a recipient are logged and count as delivered.
pub struct EmailAction<P: EmailProvider> {
    provider: P,
}

impl<P: EmailProvider> EmailAction<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }

    fn compose(recipient: &str, message: &str) -> EmailContent {
        EmailContent::new(
            recipient,
            EMAIL_SUBJECT,
            format!("{}\n\n{}", EMAIL_PREAMBLE, message),
        )
    }
}

#[async_trait]
impl<P: EmailProvider> NotificationAction for EmailAction<P> {
    async fn notify(&self, event: &TaskEvent) -> DeliveryOutcome {
        let message = event.message();

        let Some(recipient) = event.recipient.as_deref() else {
            info!(operation = %event.operation, %message, "No recipient, notification logged only");
            return DeliveryOutcome::Delivered;
        };

        let email = Self::compose(recipient, &message);
        match self.provider.send(&email).await {
            Ok(sent) => {
                debug!(
                    to = %recipient,
                    provider = self.provider.name(),
                    message_id = ?sent.message_id,
                    "Notification email sent"
                );
                DeliveryOutcome::Delivered
            }
            Err(e) if e.is_retriable() => {
                warn!(
                    to = %recipient,
                    provider = self.provider.name(),
                    error = %e,
                    "Notification email failed"
                );
                DeliveryOutcome::Failed(e.to_string())
            }
            Err(e) => {
                warn!(
                    to = %recipient,
                    provider = self.provider.name(),
                    error = %e,
                    "Notification email rejected, not retrying"
                );
                DeliveryOutcome::Rejected(e.to_string())
            }
        }
    }

    fn name(&self) -> &'static str {
        "email"
    }

    async fn health_check(&self) -> bool {
        self.provider.health_check().await.unwrap_or(false)
    }
}

/// Logs the rendered message. Never fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAction;

#[async_trait]
impl NotificationAction for LogAction {
    async fn notify(&self, event: &TaskEvent) -> DeliveryOutcome {
        info!(
            operation = %event.operation,
            recipient = event.recipient.as_deref().unwrap_or("-"),
            message = %event.message(),
            "Task notification"
        );
        DeliveryOutcome::Delivered
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
