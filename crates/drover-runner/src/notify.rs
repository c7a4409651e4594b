// Webhook notification delivery.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use drover_scheduler::Notifier;

/// Posts notification lines to an operator webhook. Delivery is best
/// effort: failures are logged at debug and never surface to callers.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Option<String>,
}

impl WebhookNotifier {
    /// An empty or absent URL disables delivery entirely.
    pub fn new(url: Option<String>) -> WebhookNotifier {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        WebhookNotifier {
            client,
            url: url.filter(|u| !u.is_empty()),
        }
    }

    async fn post(&self, level: &str, dest: &str, text: &str) {
        let Some(url) = &self.url else { return };
        let body = serde_json::json!({
            "level": level,
            "channel": dest,
            "text": text,
        });
        if let Err(err) = self.client.post(url).json(&body).send().await {
            debug!(error = %err, "notification delivery failed");
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn info(&self, dest: &str, text: &str) {
        self.post("info", dest, text).await;
    }

    async fn warning(&self, dest: &str, text: &str) {
        self.post("warning", dest, text).await;
    }
}
