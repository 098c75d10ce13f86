use async_trait::async_trait;
use tracing::{info, warn};

use super::{NotificationSender, SenderError};
use crate::notifications::models::{Notification, Severity};

/// Writes every notification to the structured log. Always installed.
#[derive(Debug, Default)]
pub struct LogSender;

#[async_trait]
impl NotificationSender for LogSender {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<(), SenderError> {
        match notification.severity {
            Severity::Critical | Severity::Warning => warn!(
                kind = notification.kind,
                title = %notification.title,
                "{}",
                notification.message
            ),
            Severity::Info => info!(
                kind = notification.kind,
                title = %notification.title,
                "{}",
                notification.message
            ),
        }
        Ok(())
    }
}
