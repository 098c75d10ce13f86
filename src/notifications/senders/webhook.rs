use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, header};

use super::{NotificationSender, SenderError};
use crate::notifications::models::Notification;

/// Posts notifications as JSON to a fixed URL.
pub struct WebhookSender {
    client: Client,
    url: String,
}

impl WebhookSender {
    pub fn new(url: impl Into<String>) -> Result<Self, SenderError> {
        let url = url.into();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(SenderError::InvalidConfiguration(format!(
                "Webhook URL must be http(s): {url}"
            )));
        }
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl NotificationSender for WebhookSender {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, notification: &Notification) -> Result<(), SenderError> {
        let response = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(notification)
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            return Err(SenderError::SendFailed(format!(
                "Webhook returned non-success status: {status}. Body: {error_body}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_urls() {
        assert!(matches!(
            WebhookSender::new("ftp://hooks.example.com"),
            Err(SenderError::InvalidConfiguration(_))
        ));
        assert!(WebhookSender::new("https://hooks.example.com/fleet").is_ok());
    }
}
