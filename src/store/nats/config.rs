//! JetStream audit store configuration

use serde::{Deserialize, Serialize};

/// Stream storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// Connection and stream settings for `NatsAuditStore`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NatsAuditConfig {
    /// Server URL
    pub url: String,

    /// JetStream stream holding the audit log
    pub stream_name: String,

    /// Subject prefix; events land on `{prefix}.{event_type}`
    pub subject_prefix: String,

    pub storage: StorageType,

    /// Maximum retained events (-1 = unlimited)
    pub max_events: i64,

    /// Maximum event age in seconds (0 = unlimited)
    pub max_age_secs: u64,

    /// Maximum stream size in bytes (-1 = unlimited)
    pub max_bytes: i64,

    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,

    /// Optional auth token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for NatsAuditConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            stream_name: "SECURITY_AUDIT".to_string(),
            subject_prefix: "audit".to_string(),
            storage: StorageType::File,
            max_events: -1,
            max_age_secs: 0,
            max_bytes: -1,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            token: None,
        }
    }
}

impl NatsAuditConfig {
    /// Subject an event of the given type is published to
    pub fn event_subject(&self, event_type: &str) -> String {
        let token: String = event_type
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}.{}", self.subject_prefix, token)
    }

    /// Subjects captured by the stream
    pub fn stream_subjects(&self) -> Vec<String> {
        vec![format!("{}.>", self.subject_prefix)]
    }
}
