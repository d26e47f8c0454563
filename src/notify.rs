//! Email delivery seam
//!
//! Delivery is best effort everywhere it is used: callers log failures and
//! carry on.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmailError {
    #[error("Email delivery failed: {0}")]
    Delivery(String),

    #[error("Email endpoint rejected message with status {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError>;
}

/// Writes messages to the log instead of sending them
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError> {
        info!(to = %message.to, subject = %message.subject, "Email (log only)");
        Ok(())
    }
}

/// POSTs each message as JSON to a mail relay webhook
pub struct WebhookEmailSender {
    client: reqwest::Client,
    url: String,
}

impl WebhookEmailSender {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, EmailError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EmailError::Delivery(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl EmailSender for WebhookEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<(), EmailError> {
        let response = self
            .client
            .post(&self.url)
            .json(message)
            .send()
            .await
            .map_err(|e| EmailError::Delivery(e.to_string()))?;

        if !response.status().is_success() {
            return Err(EmailError::Rejected(response.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "mock-api"))]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Records messages; can be switched to fail every send
    #[derive(Default)]
    pub struct MockEmailSender {
        sent: Mutex<Vec<EmailMessage>>,
        fail: Mutex<bool>,
    }

    impl MockEmailSender {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_fail(&self, fail: bool) {
            *self.fail.lock().unwrap_or_else(|p| p.into_inner()) = fail;
        }

        pub fn sent(&self) -> Vec<EmailMessage> {
            self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
        }
    }

    #[async_trait]
    impl EmailSender for MockEmailSender {
        async fn send(&self, message: &EmailMessage) -> Result<(), EmailError> {
            if *self.fail.lock().unwrap_or_else(|p| p.into_inner()) {
                return Err(EmailError::Delivery("mock failure".into()));
            }
            self.sent
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(message.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn message() -> EmailMessage {
        EmailMessage {
            to: "buyer@example.com".into(),
            subject: "Order completed".into(),
            html: "<p>Done</p>".into(),
        }
    }

    #[tokio::test]
    async fn test_webhook_posts_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/mail"))
            .and(body_json(message()))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let sender =
            WebhookEmailSender::new(format!("{}/mail", server.uri()), Duration::from_secs(5))
                .unwrap();
        sender.send(&message()).await.unwrap();
    }

    #[tokio::test]
    async fn test_webhook_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let sender = WebhookEmailSender::new(server.uri(), Duration::from_secs(5)).unwrap();
        assert_eq!(
            sender.send(&message()).await,
            Err(EmailError::Rejected(500))
        );
    }

    #[tokio::test]
    async fn test_mock_sender() {
        let sender = mock::MockEmailSender::new();
        sender.send(&message()).await.unwrap();
        sender.set_fail(true);
        assert!(sender.send(&message()).await.is_err());
        assert_eq!(sender.sent().len(), 1);
    }
}
