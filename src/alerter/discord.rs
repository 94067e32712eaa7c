use async_trait::async_trait;
use serde_json::json;

use crate::config::DiscordConfig;
use crate::error::TransportError;
use crate::types::Severity;
use super::{http_client, parse_severity_filter, Alert, AlertChannel};

/// Discord webhook alert channel
pub struct DiscordChannel {
    webhook_url: String,
    username: String,
    severity_filter: Vec<Severity>,
    client: reqwest::Client,
}

impl DiscordChannel {
    pub fn new(config: &DiscordConfig) -> Result<Self, TransportError> {
        Ok(Self {
            webhook_url: config.webhook_url.clone(),
            username: config.username.clone().unwrap_or_else(|| "Anomaly Agent".into()),
            severity_filter: parse_severity_filter(&config.severity_filter),
            client: http_client()?,
        })
    }

    fn severity_color(severity: &Severity) -> u32 {
        match severity {
            Severity::Low => 0x2ECC71,    // green
            Severity::Medium => 0xF39C12, // yellow
            Severity::High => 0xE74C3C,   // red
        }
    }

    fn payload(&self, alert: &Alert) -> serde_json::Value {
        json!({
            "username": self.username,
            "embeds": [{
                "title": format!("[{}] anomaly on {}", alert.severity, alert.hostname),
                "description": &alert.message,
                "color": Self::severity_color(&alert.severity),
                "fields": [
                    { "name": "Plugin", "value": alert.field("plugin"), "inline": true },
                    { "name": "Metric", "value": alert.field("metric"), "inline": true },
                    { "name": "Value", "value": alert.field("value"), "inline": true },
                    { "name": "Score", "value": alert.field("score"), "inline": true },
                    { "name": "Confidence", "value": alert.field("confidence"), "inline": true },
                ],
                "timestamp": alert.timestamp.to_rfc3339(),
            }]
        })
    }
}

#[async_trait]
impl AlertChannel for DiscordChannel {
    fn name(&self) -> &str { "discord" }

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
