//! Core types for the security pipeline
//!
//! All types use camelCase JSON serialization for wire compatibility with the
//! audit store and reporting consumers. Enumerations serialize in
//! SCREAMING_SNAKE_CASE (`PATIENT_VIEW`, `SQL_INJECTION`, `CRITICAL`).

use crate::taxonomy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Risk level shared by audit events, threat detections, and alerts
///
/// Totally ordered: `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation performed on a PHI-bearing resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhiAction {
    View,
    Create,
    Update,
    Delete,
    Export,
    Download,
    Print,
}

impl PhiAction {
    pub const ALL: [PhiAction; 7] = [
        Self::View,
        Self::Create,
        Self::Update,
        Self::Delete,
        Self::Export,
        Self::Download,
        Self::Print,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "VIEW",
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Export => "EXPORT",
            Self::Download => "DOWNLOAD",
            Self::Print => "PRINT",
        }
    }

    /// Parse an action name, case-insensitively
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(s))
    }
}

impl fmt::Display for PhiAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed taxonomy of security-relevant operations
///
/// PHI operations are composed from a resource type and an action and
/// render as `{RESOURCE}_{ACTION}` (e.g. `PATIENT_VIEW`). Strings that match
/// nothing in the taxonomy are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SecurityEventType {
    LoginSuccess,
    LoginFailure,
    Logout,
    SessionStart,
    SessionEnd,
    SessionTimeout,
    PhiAccess { resource: String, action: PhiAction },
    FeatureEnabled,
    FeatureDisabled,
    RoleChanged,
    UserDeactivated,
    PermissionDenied,
    UnauthorizedAccess,
    RateLimitExceeded,
    SuspiciousActivity,
    BreachSuspected,
    SystemError,
    ApiError,
    Other(String),
}

impl SecurityEventType {
    /// Compose a PHI event type from a resource type and action
    ///
    /// The resource name is normalized to SCREAMING_SNAKE_CASE, so
    /// `phi("lab-result", PhiAction::View)` renders as `LAB_RESULT_VIEW`.
    pub fn phi(resource: &str, action: PhiAction) -> Self {
        Self::PhiAccess {
            resource: normalize_resource(resource),
            action,
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Self::PhiAccess { .. })
    }

    fn fixed_name(&self) -> Option<&'static str> {
        let name = match self {
            Self::LoginSuccess => "LOGIN_SUCCESS",
            Self::LoginFailure => "LOGIN_FAILURE",
            Self::Logout => "LOGOUT",
            Self::SessionStart => "SESSION_START",
            Self::SessionEnd => "SESSION_END",
            Self::SessionTimeout => "SESSION_TIMEOUT",
            Self::FeatureEnabled => "FEATURE_ENABLED",
            Self::FeatureDisabled => "FEATURE_DISABLED",
            Self::RoleChanged => "ROLE_CHANGED",
            Self::UserDeactivated => "USER_DEACTIVATED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::UnauthorizedAccess => "UNAUTHORIZED_ACCESS",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::SuspiciousActivity => "SUSPICIOUS_ACTIVITY",
            Self::BreachSuspected => "BREACH_SUSPECTED",
            Self::SystemError => "SYSTEM_ERROR",
            Self::ApiError => "API_ERROR",
            Self::PhiAccess { .. } | Self::Other(_) => return None,
        };
        Some(name)
    }

    /// Every variant without a payload, for exhaustive table checks
    pub fn fixed_variants() -> &'static [SecurityEventType] {
        &FIXED_EVENT_TYPES
    }
}

static FIXED_EVENT_TYPES: [SecurityEventType; 17] = [
    SecurityEventType::LoginSuccess,
    SecurityEventType::LoginFailure,
    SecurityEventType::Logout,
    SecurityEventType::SessionStart,
    SecurityEventType::SessionEnd,
    SecurityEventType::SessionTimeout,
    SecurityEventType::FeatureEnabled,
    SecurityEventType::FeatureDisabled,
    SecurityEventType::RoleChanged,
    SecurityEventType::UserDeactivated,
    SecurityEventType::PermissionDenied,
    SecurityEventType::UnauthorizedAccess,
    SecurityEventType::RateLimitExceeded,
    SecurityEventType::SuspiciousActivity,
    SecurityEventType::BreachSuspected,
    SecurityEventType::SystemError,
    SecurityEventType::ApiError,
];

fn normalize_resource(resource: &str) -> String {
    resource
        .trim()
        .chars()
        .map(|c| match c {
            '-' | ' ' | '.' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

impl fmt::Display for SecurityEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PhiAccess { resource, action } => write!(f, "{}_{}", resource, action),
            Self::Other(name) => f.write_str(name),
            fixed => f.write_str(fixed.fixed_name().unwrap_or_default()),
        }
    }
}

impl From<&str> for SecurityEventType {
    fn from(s: &str) -> Self {
        let upper = s.trim().to_ascii_uppercase();

        if let Some(fixed) = FIXED_EVENT_TYPES
            .iter()
            .find(|t| t.fixed_name() == Some(upper.as_str()))
        {
            return fixed.clone();
        }

        if let Some((resource, action)) = upper.rsplit_once('_') {
            if !resource.is_empty() {
                if let Some(action) = PhiAction::parse(action) {
                    return Self::phi(resource, action);
                }
            }
        }

        Self::Other(s.to_string())
    }
}

impl From<String> for SecurityEventType {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<SecurityEventType> for String {
    fn from(t: SecurityEventType) -> Self {
        t.to_string()
    }
}

/// Acting user of an observed operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl Actor {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Network origin of an observed operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Origin {
    pub fn ip(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: Some(ip_address.into()),
            user_agent: None,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

/// The object an operation acted upon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub resource_type: String,
    pub resource_id: String,
}

/// One observed security-relevant action
///
/// Built by callers, stamped and classified by the `AuditRecorder`, then
/// appended to the audit store. `timestamp` and `risk_level` are optional on
/// input; after recording both are always set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEvent {
    /// Unique event identifier (evt-<uuid>)
    pub id: String,

    pub event_type: SecurityEventType,

    /// Unix timestamp in milliseconds, set at recording time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Actor>,

    /// Tenant scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceRef>,

    /// Event-specific context
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,

    /// True only when the event concerns protected health information
    #[serde(default)]
    pub phi_accessed: bool,

    /// Explicit risk level; takes precedence over the classified one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,
}

impl SecurityEvent {
    /// Create an event with an auto-generated id and no timestamp yet
    pub fn new(event_type: SecurityEventType) -> Self {
        Self {
            id: format!("evt-{}", uuid::Uuid::new_v4()),
            event_type,
            timestamp: None,
            actor: None,
            organization_id: None,
            origin: None,
            resource: None,
            details: BTreeMap::new(),
            phi_accessed: false,
            risk_level: None,
        }
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn with_resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        self.resource = Some(ResourceRef {
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
        });
        self
    }

    /// Add a details entry
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    pub fn with_phi_accessed(mut self, phi_accessed: bool) -> Self {
        self.phi_accessed = phi_accessed;
        self
    }

    pub fn with_risk_level(mut self, risk_level: RiskLevel) -> Self {
        self.risk_level = Some(risk_level);
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Effective risk: the explicit level if set, otherwise the classified one
    pub fn risk(&self) -> RiskLevel {
        self.risk_level
            .unwrap_or_else(|| taxonomy::classify(&self.event_type))
    }

    pub fn actor_email(&self) -> Option<&str> {
        self.actor.as_ref().and_then(|a| a.email.as_deref())
    }

    pub fn origin_ip(&self) -> Option<&str> {
        self.origin.as_ref().and_then(|o| o.ip_address.as_deref())
    }
}

/// Attack categories recognized by the threat detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatType {
    SqlInjection,
    Xss,
    PathTraversal,
    CommandInjection,
    SuspiciousUserAgent,
    AfterHoursAccess,
    RapidRequests,
    InvalidInput,
    AuthenticationAnomaly,
}

impl ThreatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SqlInjection => "SQL_INJECTION",
            Self::Xss => "XSS",
            Self::PathTraversal => "PATH_TRAVERSAL",
            Self::CommandInjection => "COMMAND_INJECTION",
            Self::SuspiciousUserAgent => "SUSPICIOUS_USER_AGENT",
            Self::AfterHoursAccess => "AFTER_HOURS_ACCESS",
            Self::RapidRequests => "RAPID_REQUESTS",
            Self::InvalidInput => "INVALID_INPUT",
            Self::AuthenticationAnomaly => "AUTHENTICATION_ANOMALY",
        }
    }
}

impl fmt::Display for ThreatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of checking one attack category
///
/// A non-match is still a value (`detected == false`) so callers can
/// aggregate uniformly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatDetection {
    pub threat_type: ThreatType,
    pub severity: RiskLevel,

    /// What matched; never the raw payload
    pub evidence: String,

    pub detected: bool,
}

impl ThreatDetection {
    pub fn detected(threat_type: ThreatType, severity: RiskLevel, evidence: impl Into<String>) -> Self {
        Self {
            threat_type,
            severity,
            evidence: evidence.into(),
            detected: true,
        }
    }

    pub fn clear(threat_type: ThreatType) -> Self {
        Self {
            threat_type,
            severity: RiskLevel::Low,
            evidence: String::new(),
            detected: false,
        }
    }
}

/// An escalated notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// Unique alert identifier (alt-<uuid>)
    pub id: String,

    /// Unix timestamp in milliseconds
    pub timestamp: u64,

    pub severity: RiskLevel,
    pub title: String,
    pub description: String,

    /// The event that triggered this alert
    pub source_event: SecurityEvent,

    /// False until every selected channel attempt has settled
    pub notified: bool,
}

/// Notification transports the escalator can fan out to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Webhook,
    Email,
    Sms,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Webhook => "webhook",
            Self::Email => "email",
            Self::Sms => "sms",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Unix milliseconds, strictly increasing within this process
pub fn next_timestamp() -> u64 {
    let now = now_millis();
    let mut prev = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(prev + 1);
        match LAST_TIMESTAMP.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}
