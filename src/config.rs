//! Pipeline configuration
//!
//! Loaded from a JSON file (camelCase keys, every field optional) with
//! channel destinations overridable from the environment.

use crate::error::{Result, SentinelError};
use crate::store::nats::NatsAuditConfig;
use crate::types::ChannelKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const ENV_ALERT_EMAIL: &str = "SENTINEL_ALERT_EMAIL";
pub const ENV_ALERT_SMS: &str = "SENTINEL_ALERT_SMS";
pub const ENV_ALERT_WEBHOOK: &str = "SENTINEL_ALERT_WEBHOOK";
pub const ENV_NATS_URL: &str = "SENTINEL_NATS_URL";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SentinelConfig {
    pub audit: AuditConfig,
    pub detector: DetectorConfig,
    pub alerting: AlertingConfig,

    /// JetStream audit store; when absent callers supply their own store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nats: Option<NatsAuditConfig>,
}

/// Audit recorder settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditConfig {
    /// Appends slower than this are abandoned and counted as failures
    pub append_timeout_ms: u64,

    /// Seal `details` of PHI events before they reach the store
    pub encrypt_phi_details: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            append_timeout_ms: 2_000,
            encrypt_phi_details: false,
        }
    }
}

/// Threat detector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectorConfig {
    /// Roles treated as administrative for the after-hours rule
    pub admin_roles: Vec<String>,

    /// First hour (inclusive) of the after-hours window
    pub after_hours_start: u32,

    /// Hour (exclusive) at which the after-hours window ends; must differ from the start
    pub after_hours_end: u32,

    /// Offset from UTC used for the after-hours rule; server local time if unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utc_offset_minutes: Option<i32>,

    /// Larger url/body inputs are flagged as invalid
    pub max_input_bytes: usize,

    /// Requests per origin IP tolerated inside the window
    pub rapid_request_limit: usize,
    pub rapid_request_window_secs: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            admin_roles: vec![
                "admin".to_string(),
                "super_admin".to_string(),
                "org_admin".to_string(),
            ],
            after_hours_start: 23,
            after_hours_end: 5,
            utc_offset_minutes: None,
            max_input_bytes: 64 * 1024,
            rapid_request_limit: 100,
            rapid_request_window_secs: 60,
        }
    }
}

/// Alert escalation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertingConfig {
    /// Capacity of the recent-alerts ring buffer
    pub buffer_capacity: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email_recipient: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sms_recipient: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,

    /// Failed logins per email tolerated inside the window
    pub failed_login_limit: usize,
    pub failed_login_window_secs: u64,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            email_recipient: None,
            sms_recipient: None,
            webhook_url: None,
            failed_login_limit: 5,
            failed_login_window_secs: 300,
        }
    }
}

impl AlertingConfig {
    /// Configured destination for a channel, if any
    pub fn destination(&self, kind: ChannelKind) -> Option<&str> {
        let dest = match kind {
            ChannelKind::Webhook => self.webhook_url.as_deref(),
            ChannelKind::Email => self.email_recipient.as_deref(),
            ChannelKind::Sms => self.sms_recipient.as_deref(),
        };
        dest.filter(|d| !d.trim().is_empty())
    }
}

impl SentinelConfig {
    /// Parse a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SentinelError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config: Self = serde_json::from_str(&json).map_err(|e| {
            SentinelError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;

        config.validate()?;
        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Override destinations from `SENTINEL_*` environment variables
    pub fn apply_env(mut self) -> Self {
        self.apply_vars(|key| std::env::var(key).ok());
        self
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(email) = var(ENV_ALERT_EMAIL) {
            self.alerting.email_recipient = Some(email);
        }
        if let Some(sms) = var(ENV_ALERT_SMS) {
            self.alerting.sms_recipient = Some(sms);
        }
        if let Some(url) = var(ENV_ALERT_WEBHOOK) {
            self.alerting.webhook_url = Some(url);
        }
        if let Some(url) = var(ENV_NATS_URL) {
            self.nats.get_or_insert_with(NatsAuditConfig::default).url = url;
        }
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.alerting.buffer_capacity == 0 {
            return Err(SentinelError::Config(
                "alerting.bufferCapacity must be greater than zero".to_string(),
            ));
        }
        let d = &self.detector;
        if d.after_hours_start > 23 || d.after_hours_end > 24 {
            return Err(SentinelError::Config(format!(
                "after-hours window {}..{} is outside 0..24",
                d.after_hours_start, d.after_hours_end
            )));
        }
        if d.after_hours_start == d.after_hours_end {
            return Err(SentinelError::Config(format!(
                "after-hours window {}..{} is empty",
                d.after_hours_start, d.after_hours_end
            )));
        }
        if let Some(offset) = d.utc_offset_minutes {
            if offset.abs() >= 24 * 60 {
                return Err(SentinelError::Config(format!(
                    "detector.utcOffsetMinutes {} is out of range",
                    offset
                )));
            }
        }
        if d.rapid_request_limit == 0 || self.alerting.failed_login_limit == 0 {
            return Err(SentinelError::Config(
                "rate limits must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
