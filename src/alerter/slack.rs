use async_trait::async_trait;
use serde_json::json;

use crate::config::SlackConfig;
use crate::error::TransportError;
use crate::types::Severity;
use super::{http_client, parse_severity_filter, Alert, AlertChannel};

/// Slack webhook alert channel
pub struct SlackChannel {
    webhook_url: String,
    channel: Option<String>,
    severity_filter: Vec<Severity>,
    client: reqwest::Client,
}

impl SlackChannel {
    pub fn new(config: &SlackConfig) -> Result<Self, TransportError> {
        Ok(Self {
            webhook_url: config.webhook_url.clone(),
            channel: config.channel.clone(),
            severity_filter: parse_severity_filter(&config.severity_filter),
            client: http_client()?,
        })
    }

    fn severity_color(severity: &Severity) -> &'static str {
        match severity {
            Severity::Low => "#2ecc71",
            Severity::Medium => "#f39c12",
            Severity::High => "#e74c3c",
        }
    }

    fn payload(&self, alert: &Alert) -> serde_json::Value {
        let mut payload = json!({
            "attachments": [{
                "color": Self::severity_color(&alert.severity),
                "title": format!("[{}] anomaly on {}", alert.severity, alert.hostname),
                "text": &alert.message,
                "fields": [
                    { "title": "Plugin", "value": alert.field("plugin"), "short": true },
                    { "title": "Metric", "value": alert.field("metric"), "short": true },
                    { "title": "Value", "value": alert.field("value"), "short": true },
                    { "title": "Score", "value": alert.field("score"), "short": true },
                    { "title": "Type", "value": alert.field("anomaly_type"), "short": true },
                    { "title": "Confidence", "value": alert.field("confidence"), "short": true },
                ],
                "ts": alert.timestamp.timestamp(),
            }]
        });

        if let Some(ref ch) = self.channel {
            payload["channel"] = json!(ch);
        }
        payload
    }
}

#[async_trait]
impl AlertChannel for SlackChannel {
    fn name(&self) -> &str { "slack" }

    fn accepts_severity(&self, severity: &Severity) -> bool {
        self.severity_filter.is_empty() || self.severity_filter.contains(severity)
    }

    async fn send(&self, alert: &Alert) -> Result<(), TransportError> {
        let payload = self.payload(alert);
        self.client.post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        Ok(())
    }
}
