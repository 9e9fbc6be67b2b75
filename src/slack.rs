//! Best-effort Slack notifications for scale events. A webhook failure is
//! logged and forgotten; it never retries and never blocks the loop.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::Config;

const USERNAME: &str = "Kubernetes Volume Autoscaler";
const ICON_URL: &str =
    "https://raw.githubusercontent.com/DevOps-Nirvana/Kubernetes-Volume-Autoscaler/master/icon.png";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

impl Severity {
    fn label(self) -> &'static str {
        match self {
            Severity::Info => "Info",
            Severity::Error => "Error",
        }
    }

    fn emoji(self) -> &'static str {
        match self {
            Severity::Info => ":information_source:",
            Severity::Error => ":exclamation:",
        }
    }
}

pub struct SlackNotifier {
    http: reqwest::Client,
    webhook_url: String,
    channel: String,
    prefix: String,
    suffix: String,
}

impl SlackNotifier {
    /// Build a notifier from config, or `None` when the webhook URL is unset
    /// or dry-run is active (a dry run must not announce resizes that never
    /// happened).
    pub fn from_config(config: &Config) -> Option<Self> {
        if config.slack_webhook_url.is_empty() || config.dry_run {
            return None;
        }
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .ok()?;
        Some(SlackNotifier {
            http,
            webhook_url: config.slack_webhook_url.clone(),
            channel: config.slack_channel.clone(),
            prefix: config.slack_message_prefix.trim().to_string(),
            suffix: config.slack_message_suffix.trim().to_string(),
        })
    }

    fn payload(&self, body: &str, severity: Severity) -> Value {
        let mut text = String::new();
        if severity == Severity::Error {
            text.push_str("<!channel> ERROR: ");
        }
        if !self.prefix.is_empty() {
            text.push_str(&self.prefix);
            text.push(' ');
        }
        text.push_str(body);
        if !self.suffix.is_empty() {
            text.push(' ');
            text.push_str(&self.suffix);
        }

        let mut payload = json!({
            "username": format!("{USERNAME} - {}", severity.label()),
            "text": text,
            "link_names": 1,
        });
        if !self.channel.is_empty() {
            payload["channel"] = json!(self.channel);
        }
        match severity {
            Severity::Error => payload["icon_emoji"] = json!(severity.emoji()),
            Severity::Info => payload["icon_url"] = json!(ICON_URL),
        }
        payload
    }

    pub async fn send(&self, body: &str, severity: Severity) {
        debug!(channel = %self.channel, "sending Slack notification");
        let result = self
            .http
            .post(&self.webhook_url)
            .json(&self.payload(body, severity))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                debug!("Slack notification sent");
            }
            Ok(response) => {
                warn!(status = %response.status(), "Slack webhook rejected notification");
            }
            Err(e) => {
                warn!("failed to send Slack notification: {e}");
            }
        }
    }
}
