pub mod discord;
pub mod slack;
pub mod webhook;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::AlertingConfig;
use crate::error::TransportError;
use crate::types::Severity;

/// Delivers a formatted anomaly notification somewhere a human will see it.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        message: &str,
        severity: Severity,
        context: &BTreeMap<String, String>,
    ) -> Result<(), TransportError>;
}

/// One notification as handed to a channel
#[derive(Debug, Clone)]
pub struct Alert {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
    pub hostname: String,
    pub context: BTreeMap<String, String>,
}

impl Alert {
    fn field(&self, key: &str) -> &str {
        self.context.get(key).map(String::as_str).unwrap_or("-")
    }
}

/// Trait for alert delivery channels
#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Channel name
    fn name(&self) -> &str;

    /// Send a single alert
    async fn send(&self, alert: &Alert) -> Result<(), TransportError>;

    /// Check if this channel accepts the given severity
    fn accepts_severity(&self, severity: &Severity) -> bool;
}

/// Severity names from config; unknown names are ignored, an empty list accepts all.
pub(crate) fn parse_severity_filter(names: &[String]) -> Vec<Severity> {
    names
        .iter()
        .filter_map(|s| match s.to_ascii_lowercase().as_str() {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            other => {
                tracing::warn!(severity = other, "Ignoring unknown severity in filter");
                None
            }
        })
        .collect()
}

pub(crate) fn http_client() -> Result<reqwest::Client, TransportError> {
    Ok(reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?)
}

/// Fans a notification out to every configured channel that accepts its severity
pub struct AlertManager {
    channels: Vec<Box<dyn AlertChannel>>,
    hostname: String,
}

impl AlertManager {
    pub fn new(config: &AlertingConfig, hostname: &str) -> Result<Self, TransportError> {
        let mut channels: Vec<Box<dyn AlertChannel>> = Vec::new();

        if let Some(ref dc) = config.discord {
            if dc.enabled {
                channels.push(Box::new(discord::DiscordChannel::new(dc)?));
            }
        }

        if let Some(ref sc) = config.slack {
            if sc.enabled {
                channels.push(Box::new(slack::SlackChannel::new(sc)?));
            }
        }

        if let Some(ref wc) = config.webhook {
            if wc.enabled {
                channels.push(Box::new(webhook::WebhookChannel::new(wc)?));
            }
        }

        tracing::info!(channels = channels.len(), "Initialized alert channels");
        Ok(Self::with_channels(channels, hostname))
    }

    pub fn with_channels(channels: Vec<Box<dyn AlertChannel>>, hostname: &str) -> Self {
        Self { channels, hostname: hostname.to_string() }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[async_trait]
impl Notifier for AlertManager {
    async fn send(
        &self,
        message: &str,
        severity: Severity,
        context: &BTreeMap<String, String>,
    ) -> Result<(), TransportError> {
        if self.channels.is_empty() {
            tracing::warn!(severity = %severity, "{}", message);
            return Ok(());
        }

        let alert = Alert {
            timestamp: context
                .get("timestamp")
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
            severity,
            message: message.to_string(),
            hostname: self.hostname.clone(),
            context: context.clone(),
        };

        let mut attempted = 0usize;
        let mut delivered = 0usize;
        for channel in &self.channels {
            if !channel.accepts_severity(&severity) {
                continue;
            }
            attempted += 1;
            match channel.send(&alert).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::error!(
                        channel = channel.name(),
                        error = %e,
                        "Failed to send alert"
                    );
                }
            }
        }

        if attempted > 0 && delivered == 0 {
            return Err(TransportError::AllChannelsFailed { attempted });
        }
        if attempted == 0 {
            tracing::debug!(severity = %severity, "No channel accepts this severity");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct MockChannel {
        name: &'static str,
        accepts: Vec<Severity>,
        fail: bool,
        sent: Arc<Mutex<Vec<Alert>>>,
    }

    #[async_trait]
    impl AlertChannel for MockChannel {
        fn name(&self) -> &str { self.name }

        async fn send(&self, alert: &Alert) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Channel { channel: self.name.into(), reason: "down".into() });
            }
            self.sent.lock().unwrap().push(alert.clone());
            Ok(())
        }

        fn accepts_severity(&self, severity: &Severity) -> bool {
            self.accepts.is_empty() || self.accepts.contains(severity)
        }
    }

    fn mock(name: &'static str, accepts: Vec<Severity>, fail: bool) -> (Box<dyn AlertChannel>, Arc<Mutex<Vec<Alert>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let channel: Box<dyn AlertChannel> = Box::new(MockChannel { name, accepts, fail, sent: sent.clone() });
        (channel, sent)
    }

    fn context() -> BTreeMap<String, String> {
        let mut ctx = BTreeMap::new();
        ctx.insert("plugin".to_string(), "cpu".to_string());
        ctx.insert("timestamp".to_string(), "2026-04-01T12:00:00Z".to_string());
        ctx
    }

    #[tokio::test]
    async fn one_success_is_enough() {
        let (bad, _) = mock("bad", vec![], true);
        let (good, sent) = mock("good", vec![], false);
        let manager = AlertManager::with_channels(vec![bad, good], "web-01");

        manager.send("cpu anomaly", Severity::High, &context()).await.unwrap();
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].hostname, "web-01");
        assert_eq!(sent[0].field("plugin"), "cpu");
        assert_eq!(sent[0].timestamp.to_rfc3339(), "2026-04-01T12:00:00+00:00");
    }

    #[tokio::test]
    async fn all_failures_surface() {
        let (a, _) = mock("a", vec![], true);
        let (b, _) = mock("b", vec![], true);
        let manager = AlertManager::with_channels(vec![a, b], "web-01");

        let err = manager.send("x", Severity::Low, &context()).await.unwrap_err();
        assert!(matches!(err, TransportError::AllChannelsFailed { attempted: 2 }));
    }

    #[tokio::test]
    async fn severity_filter_skips_channels() {
        let (high_only, high_sent) = mock("pager", vec![Severity::High], true);
        let (all, all_sent) = mock("chat", vec![], false);
        let manager = AlertManager::with_channels(vec![high_only, all], "web-01");

        // the failing pager never sees a medium alert
        manager.send("x", Severity::Medium, &context()).await.unwrap();
        assert!(high_sent.lock().unwrap().is_empty());
        assert_eq!(all_sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_channels_logs_and_succeeds() {
        let manager = AlertManager::with_channels(Vec::new(), "web-01");
        assert_eq!(manager.channel_count(), 0);
        manager.send("x", Severity::High, &BTreeMap::new()).await.unwrap();
    }

    #[test]
    fn severity_filter_parsing() {
        let names = vec!["HIGH".to_string(), "medium".to_string(), "critical".to_string()];
        assert_eq!(parse_severity_filter(&names), vec![Severity::High, Severity::Medium]);
    }

    #[test]
    fn manager_builds_only_enabled_channels() {
        let config = crate::config::Config::parse(
            r#"
            [alerting.slack]
            enabled = false
            webhook_url = "http://127.0.0.1:9/slack"

            [alerting.webhook]
            enabled = true
            url = "http://127.0.0.1:9/hook"
            "#,
        )
        .unwrap();
        let manager = AlertManager::new(&config.alerting, "web-01").unwrap();
        assert_eq!(manager.channel_count(), 1);
    }
}
