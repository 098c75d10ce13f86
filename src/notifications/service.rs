use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::models::Notification;
use super::senders::{NotificationSender, SenderError, log::LogSender, webhook::WebhookSender};
use crate::events::{EventBus, FleetEvent};
use crate::server::config::NotificationConfig;

/// Fans notifiable fleet events out to every configured sender.
#[derive(Clone)]
pub struct NotificationDispatcher {
    senders: Vec<Arc<dyn NotificationSender>>,
}

impl NotificationDispatcher {
    pub fn new(senders: Vec<Arc<dyn NotificationSender>>) -> Self {
        Self { senders }
    }

    /// The log sender, plus a webhook when one is configured.
    pub fn from_config(config: &NotificationConfig) -> Result<Self, SenderError> {
        let mut senders: Vec<Arc<dyn NotificationSender>> = vec![Arc::new(LogSender)];
        if let Some(url) = config.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
            senders.push(Arc::new(WebhookSender::new(url.trim())?));
        }
        Ok(Self::new(senders))
    }

    pub fn sender_names(&self) -> Vec<&'static str> {
        self.senders.iter().map(|s| s.name()).collect()
    }

    /// Sends one event. Returns how many senders accepted it.
    pub async fn dispatch(&self, event: &FleetEvent) -> usize {
        let Some(notification) = Notification::from_event(event, Utc::now()) else {
            return 0;
        };
        let mut delivered = 0;
        for sender in &self.senders {
            match sender.send(&notification).await {
                Ok(()) => delivered += 1,
                Err(e) => error!(sender = sender.name(), kind = notification.kind, error = %e, "Failed to send notification."),
            }
        }
        delivered
    }

    /// Subscribes to `bus` and dispatches until the bus is dropped.
    pub fn spawn(self, bus: &EventBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        info!(senders = ?self.sender_names(), "Notification dispatcher started.");
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.is_notifiable() {
                            self.dispatch(&event).await;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Notification dispatcher fell behind; events dropped.");
                    }
                    Err(RecvError::Closed) => {
                        debug!("Event bus closed; notification dispatcher stopping.");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    #[async_trait]
    impl NotificationSender for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn send(&self, notification: &Notification) -> Result<(), SenderError> {
            self.0.lock().unwrap().push(notification.title.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatches_notifiable_events_only() {
        let recording = Arc::new(Recording::default());
        let sender: Arc<dyn NotificationSender> = recording.clone();
        let dispatcher = NotificationDispatcher::new(vec![sender]);

        let down = FleetEvent::MonitorDown {
            monitor_id: 1,
            team_id: 1,
            name: "api".into(),
            error: Some("Error: Connection refused".into()),
        };
        assert_eq!(dispatcher.dispatch(&down).await, 1);

        let job = FleetEvent::JobStatusChanged {
            job_id: 1,
            server_id: 1,
            job_type: "ssl_renew".into(),
            from: None,
            to: crate::db::enums::JobStatus::Pending,
        };
        assert_eq!(dispatcher.dispatch(&job).await, 0);
        assert_eq!(recording.0.lock().unwrap().as_slice(), ["Monitor 'api' is down"]);
    }

    #[test]
    fn webhook_is_optional() {
        let without = NotificationDispatcher::from_config(&NotificationConfig::default()).unwrap();
        assert_eq!(without.sender_names(), ["log"]);

        let with = NotificationDispatcher::from_config(&NotificationConfig {
            webhook_url: Some("https://hooks.example.com/x".into()),
        })
        .unwrap();
        assert_eq!(with.sender_names(), ["log", "webhook"]);
    }
}
