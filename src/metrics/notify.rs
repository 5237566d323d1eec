use crate::config::NotificationsConfig;
use crate::error::ControlError;
use crate::metrics::alerts::{Alert, Severity};
use std::sync::Arc;

/// One notification sink. Implementations must be cheap to clone behind an
/// `Arc` and must not block beyond their own transport timeout.
#[async_trait::async_trait]
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> &str;
    async fn send(&self, alert: &Alert) -> Result<(), ControlError>;
}

/// Severity → channel-kind routing table.
fn kinds_for(severity: Severity) -> &'static [&'static str] {
    match severity {
        Severity::Info => &["chat"],
        Severity::Warning => &["chat", "email"],
        Severity::Error | Severity::Critical => &["chat", "email", "pager"],
    }
}

/// Fans alerts out to the configured sinks by severity.
///
/// A failing channel is logged and skipped; the alert evaluator re-emits on
/// the next tick if the condition still holds, so there is no synchronous
/// retry here.
pub struct Notifier {
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl Notifier {
    pub fn new(channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self { channels }
    }

    /// Build the production sinks from configuration.
    pub fn from_config(config: &NotificationsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        let channels = config
            .channels
            .iter()
            .filter(|c| c.enabled)
            .map(|c| {
                Arc::new(HttpChannel {
                    kind: c.kind.clone(),
                    endpoint: c.endpoint.clone(),
                    client: client.clone(),
                }) as Arc<dyn NotificationChannel>
            })
            .collect();
        Self { channels }
    }

    pub async fn dispatch(&self, alert: &Alert) {
        let kinds = kinds_for(alert.severity);
        for channel in &self.channels {
            if !kinds.contains(&channel.kind()) {
                continue;
            }
            match channel.send(alert).await {
                Ok(()) => {
                    metrics::counter!(
                        "aether_notifications_sent_total",
                        "channel" => channel.kind().to_string(),
                    )
                    .increment(1);
                }
                Err(e) => {
                    tracing::warn!(
                        "notify: channel send failed, channel={}, alert={}, error={}",
                        channel.kind(),
                        alert.id,
                        e
                    );
                    metrics::counter!(
                        "aether_notifications_failed_total",
                        "channel" => channel.kind().to_string(),
                    )
                    .increment(1);
                }
            }
        }
    }
}

/// HTTP sink: POSTs the alert as JSON to the configured endpoint. Chat
/// webhooks, email relays and pager bridges all speak this shape.
struct HttpChannel {
    kind: String,
    endpoint: String,
    client: reqwest::Client,
}

#[async_trait::async_trait]
impl NotificationChannel for HttpChannel {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn send(&self, alert: &Alert) -> Result<(), ControlError> {
        self.client
            .post(&self.endpoint)
            .json(alert)
            .send()
            .await
            .map_err(|e| ControlError::Unavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| ControlError::Unavailable(e.to_string()))?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingChannel;
    use super::*;

    fn alert(severity: Severity) -> Alert {
        Alert {
            id: "alert-1".into(),
            component: "market".into(),
            severity,
            metric: "error_rate".into(),
            value: 0.5,
            threshold: 0.1,
            opened_at_ms: 0,
            closed_at_ms: None,
        }
    }

    #[tokio::test]
    async fn test_info_reaches_only_chat() {
        let chat = RecordingChannel::new("chat");
        let email = RecordingChannel::new("email");
        let pager = RecordingChannel::new("pager");
        let notifier = Notifier::new(vec![chat.clone(), email.clone(), pager.clone()]);

        notifier.dispatch(&alert(Severity::Info)).await;

        assert_eq!(chat.sent.lock().unwrap().len(), 1);
        assert!(email.sent.lock().unwrap().is_empty());
        assert!(pager.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_error_reaches_all_three() {
        let chat = RecordingChannel::new("chat");
        let email = RecordingChannel::new("email");
        let pager = RecordingChannel::new("pager");
        let notifier = Notifier::new(vec![chat.clone(), email.clone(), pager.clone()]);

        notifier.dispatch(&alert(Severity::Error)).await;

        assert_eq!(chat.sent.lock().unwrap().len(), 1);
        assert_eq!(email.sent.lock().unwrap().len(), 1);
        assert_eq!(pager.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_channel_does_not_block_others() {
        let chat: Arc<dyn NotificationChannel> = Arc::new(super::testing::RecordingChannel {
            kind: "chat".into(),
            sent: std::sync::Mutex::new(Vec::new()),
            fail: true,
        });
        let email = RecordingChannel::new("email");
        let notifier = Notifier::new(vec![chat, email.clone()]);

        notifier.dispatch(&alert(Severity::Warning)).await;
        assert_eq!(email.sent.lock().unwrap().len(), 1);
    }
}
