use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::error::{Error, Result};
use crate::sizing::format_bytes;

/// Global configuration, read once at startup from the process environment.
/// Per-PVC annotations may override the scaling knobs (see `policy`).
#[derive(Debug, Clone)]
pub struct Config {
    /// GCP project hosting the Managed Prometheus endpoint. `None` means the
    /// GCE metadata service is consulted at startup.
    pub gcp_project_id: Option<String>,
    pub interval_time: Duration,
    pub scale_above_percent: u32,
    pub scale_after_intervals: u32,
    pub scale_up_percent: u32,
    pub scale_up_min_increment: u64,
    pub scale_up_max_increment: u64,
    pub scale_up_max_size: u64,
    pub scale_cooldown_time: Duration,
    pub dry_run: bool,
    pub verbose: bool,
    /// PromQL label matcher body inserted verbatim into every query,
    /// without braces. e.g. `namespace="dev"`
    pub gmp_label_match: String,
    pub http_timeout: Duration,
    pub slack_webhook_url: String,
    pub slack_channel: String,
    pub slack_message_prefix: String,
    pub slack_message_suffix: String,
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) if !raw.is_empty() => raw
            .parse::<T>()
            .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}"))),
        _ => Ok(default),
    }
}

fn env_bool(key: &str) -> bool {
    env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Read and validate the whole configuration. Any unparseable or
    /// out-of-range value is fatal; a typo here must not start a controller
    /// that silently scales with the wrong bounds.
    pub fn from_env() -> Result<Self> {
        let config = Config {
            gcp_project_id: env::var("GCP_PROJECT_ID").ok().filter(|v| !v.is_empty()),
            interval_time: Duration::from_secs(env_parse("INTERVAL_TIME", 60u64)?),
            scale_above_percent: env_parse("SCALE_ABOVE_PERCENT", 80u32)?,
            scale_after_intervals: env_parse("SCALE_AFTER_INTERVALS", 5u32)?,
            scale_up_percent: env_parse("SCALE_UP_PERCENT", 20u32)?,
            scale_up_min_increment: env_parse("SCALE_UP_MIN_INCREMENT", 1_000_000_000u64)?,
            scale_up_max_increment: env_parse("SCALE_UP_MAX_INCREMENT", 16_000_000_000_000u64)?,
            scale_up_max_size: env_parse("SCALE_UP_MAX_SIZE", 16_000_000_000_000u64)?,
            scale_cooldown_time: Duration::from_secs(env_parse("SCALE_COOLDOWN_TIME", 22_200u64)?),
            dry_run: env_bool("DRY_RUN"),
            verbose: env_bool("VERBOSE"),
            gmp_label_match: env_string("GMP_LABEL_MATCH", ""),
            http_timeout: Duration::from_secs(env_parse("HTTP_TIMEOUT", 15u64)?),
            slack_webhook_url: env_string("SLACK_WEBHOOK_URL", ""),
            slack_channel: env_string("SLACK_CHANNEL", "devops"),
            slack_message_prefix: env_string("SLACK_MESSAGE_PREFIX", ""),
            slack_message_suffix: env_string("SLACK_MESSAGE_SUFFIX", ""),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !(1..=99).contains(&self.scale_above_percent) {
            return Err(Error::Config(format!(
                "SCALE_ABOVE_PERCENT must be within [1, 99], got {}",
                self.scale_above_percent
            )));
        }
        if self.scale_after_intervals < 1 {
            return Err(Error::Config(
                "SCALE_AFTER_INTERVALS must be at least 1".to_string(),
            ));
        }
        if self.scale_up_max_increment < self.scale_up_min_increment {
            return Err(Error::Config(format!(
                "SCALE_UP_MAX_INCREMENT ({}) must not be below SCALE_UP_MIN_INCREMENT ({})",
                self.scale_up_max_increment, self.scale_up_min_increment
            )));
        }
        if self.interval_time.is_zero() {
            return Err(Error::Config("INTERVAL_TIME must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Key/value pairs exported through the `settings_info` metric.
    pub fn settings(&self, project_id: &str) -> Vec<(&'static str, String)> {
        vec![
            ("interval_time_seconds", self.interval_time.as_secs().to_string()),
            ("scale_above_percent", self.scale_above_percent.to_string()),
            ("scale_after_intervals", self.scale_after_intervals.to_string()),
            ("scale_up_percent", self.scale_up_percent.to_string()),
            ("scale_up_minimum_increment_bytes", self.scale_up_min_increment.to_string()),
            ("scale_up_maximum_increment_bytes", self.scale_up_max_increment.to_string()),
            ("scale_up_maximum_size_bytes", self.scale_up_max_size.to_string()),
            ("scale_cooldown_time_seconds", self.scale_cooldown_time.as_secs().to_string()),
            ("gcp_project_id", project_id.to_string()),
            ("dry_run", self.dry_run.to_string()),
            ("gmp_label_match", self.gmp_label_match.clone()),
            ("http_timeout_seconds", self.http_timeout.as_secs().to_string()),
            ("verbose_enabled", self.verbose.to_string()),
        ]
    }

    /// Report the running configuration to the operator at startup.
    pub fn log_banner(&self, project_id: &str) {
        info!("Volume Autoscaler configuration:");
        info!("  GCP project: {}", project_id);
        info!("  Label selector: {{{}}}", self.gmp_label_match);
        info!("  Query interval: {} seconds", self.interval_time.as_secs());
        info!(
            "  Scale after: {} intervals ({} seconds total)",
            self.scale_after_intervals,
            self.scale_after_intervals as u64 * self.interval_time.as_secs()
        );
        info!("  Scale when volume over: {}%", self.scale_above_percent);
        info!("  Scale up by: {}% of current size", self.scale_up_percent);
        info!("  Min increment: {}", format_bytes(self.scale_up_min_increment));
        info!("  Max increment: {}", format_bytes(self.scale_up_max_increment));
        info!("  Max size: {}", format_bytes(self.scale_up_max_size));
        info!("  Cooldown period: {} seconds", self.scale_cooldown_time.as_secs());
        info!("  HTTP timeout: {} seconds", self.http_timeout.as_secs());
        info!(
            "  Dry run: {}",
            if self.dry_run { "ENABLED (no scaling will occur)" } else { "disabled" }
        );
        info!(
            "  Slack notifications: {}",
            if self.slack_webhook_url.is_empty() { "disabled" } else { "enabled" }
        );
        if !self.slack_webhook_url.is_empty() {
            info!("    Slack channel: {}", self.slack_channel);
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gcp_project_id: None,
            interval_time: Duration::from_secs(60),
            scale_above_percent: 80,
            scale_after_intervals: 5,
            scale_up_percent: 20,
            scale_up_min_increment: 1_000_000_000,
            scale_up_max_increment: 16_000_000_000_000,
            scale_up_max_size: 16_000_000_000_000,
            scale_cooldown_time: Duration::from_secs(22_200),
            dry_run: false,
            verbose: false,
            gmp_label_match: String::new(),
            http_timeout: Duration::from_secs(15),
            slack_webhook_url: String::new(),
            slack_channel: "devops".to_string(),
            slack_message_prefix: String::new(),
            slack_message_suffix: String::new(),
        }
    }
}
