//! Mock email provider for testing

use super::{EmailContent, EmailProvider, SentEmail};
use crate::error::{NotificationError, NotificationResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;

/// Mock email provider that captures sent emails.
///
/// Like the SMTP provider, it refuses recipients that are not an address.
/// Clones share the captured mailbox, so a test can keep a handle while the
/// provider is moved into an action.
#[derive(Clone, Default)]
pub struct MockEmailProvider {
    sent_emails: Arc<Mutex<Vec<EmailContent>>>,
    attempts: Arc<AtomicU32>,
    failures_left: Arc<AtomicU32>,
    always_fail: bool,
}

impl MockEmailProvider {
    /// Create a new mock provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock provider that always fails
    pub fn failing() -> Self {
        Self {
            always_fail: true,
            ..Self::default()
        }
    }

    /// Create a mock provider whose first `times` sends fail
    pub fn failing_times(times: u32) -> Self {
        let provider = Self::default();
        provider.failures_left.store(times, Ordering::SeqCst);
        provider
    }

    /// Get all sent emails
    pub async fn sent_emails(&self) -> Vec<EmailContent> {
        self.sent_emails.lock().await.clone()
    }

    /// Get the count of sent emails
    pub async fn sent_count(&self) -> usize {
        self.sent_emails.lock().await.len()
    }

    /// Send calls made, failed ones included
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Check if an email was sent to a specific address
    pub async fn was_sent_to(&self, email: &str) -> bool {
        self.sent_emails
            .lock()
            .await
            .iter()
            .any(|e| e.to_email == email)
    }

    fn should_fail(&self) -> bool {
        if self.always_fail {
            return true;
        }
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EmailProvider for MockEmailProvider {
    async fn send(&self, email: &EmailContent) -> NotificationResult<SentEmail> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        if !email.to_email.contains('@') {
            return Err(NotificationError::InvalidEmail(email.to_email.clone()));
        }

        if self.should_fail() {
            return Err(NotificationError::ProviderError(
                "Mock failure: connection refused".to_string(),
            ));
        }

        self.sent_emails.lock().await.push(email.clone());

        Ok(SentEmail {
            message_id: Some(format!("mock-{}", attempt)),
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }

    async fn health_check(&self) -> NotificationResult<bool> {
        Ok(!self.always_fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_provider_sends_email() {
        let provider = MockEmailProvider::new();

        let email = EmailContent::new("test@example.com", "Test Subject", "Test body");
        let sent = provider.send(&email).await.unwrap();

        assert_eq!(sent.message_id.as_deref(), Some("mock-1"));
        assert_eq!(provider.sent_count().await, 1);
        assert!(provider.was_sent_to("test@example.com").await);
    }

    #[tokio::test]
    async fn test_mock_provider_fails() {
        let provider = MockEmailProvider::failing();

        let email = EmailContent::new("test@example.com", "Test Subject", "Test body");
        assert!(provider.send(&email).await.is_err());
        assert_eq!(provider.sent_count().await, 0);
        assert_eq!(provider.attempts(), 1);
        assert!(!provider.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_mock_provider_recovers_after_failures() {
        let provider = MockEmailProvider::failing_times(2);
        let email = EmailContent::new("test@example.com", "Subject", "Body");

        assert!(provider.send(&email).await.is_err());
        assert!(provider.send(&email).await.is_err());
        assert!(provider.send(&email).await.is_ok());
        assert_eq!(provider.attempts(), 3);
        assert_eq!(provider.sent_count().await, 1);
    }

    #[tokio::test]
    async fn test_mock_provider_refuses_invalid_address() {
        let provider = MockEmailProvider::new();

        let err = provider
            .send(&EmailContent::new("not-an-address", "Subject", "Body"))
            .await
            .unwrap_err();

        assert!(matches!(err, NotificationError::InvalidEmail(_)));
        assert_eq!(provider.sent_count().await, 0);
    }

    #[tokio::test]
    async fn test_clones_share_mailbox() {
        let provider = MockEmailProvider::new();
        let handle = provider.clone();

        provider
            .send(&EmailContent::new("a@b.com", "Subject", "Body"))
            .await
            .unwrap();

        assert!(handle.was_sent_to("a@b.com").await);
    }
}
