use async_trait::async_trait;
use serde_json::json;

use crate::config::WebhookConfig;
use crate::error::TransportError;
use crate::types::Severity;
use super::{http_client, parse_severity_filter, Alert, AlertChannel};

/// Custom webhook alert channel
pub struct WebhookChannel {
    url: String,
    headers: std::collections::HashMap<String, String>,
    severity_filter: Vec<Severity>,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(config: &WebhookConfig) -> Result<Self, TransportError> {
        Ok(Self {
            url: config.url.clone(),
            headers: config.headers.clone(),
            severity_filter: parse_severity_filter(&config.severity_filter),
            client: http_client()?,
        })
    }

    fn payload(alert: &Alert) -> serde_json::Value {
        json!({
            "hostname": &alert.hostname,
            "severity": alert.severity,
            "message": &alert.message,
            "timestamp": alert.timestamp.to_rfc3339(),
            "context": &alert.context,
        })
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &str { "webhook" }

    fn accepts_severity(&self, severity: &Severity) -> bool {
        self.severity_filter.is_empty() || self.severity_filter.contains(severity)
    }

    async fn send(&self, alert: &Alert) -> Result<(), TransportError> {
        let mut req = self.client.post(&self.url).json(&Self::payload(alert));
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }

        req.send().await?.error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    #[test]
    fn payload_carries_context() {
        let mut context = BTreeMap::new();
        context.insert("metric".to_string(), "usage_percent".to_string());
        let alert = Alert {
            timestamp: Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap(),
            severity: Severity::Medium,
            message: "cpu anomaly".into(),
            hostname: "web-01".into(),
            context,
        };

        let payload = WebhookChannel::payload(&alert);
        assert_eq!(payload["severity"], "medium");
        assert_eq!(payload["context"]["metric"], "usage_percent");
        assert_eq!(payload["timestamp"], "2026-04-01T12:00:00+00:00");
    }
}
