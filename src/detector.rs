//! Threat detection over inbound request material
//!
//! Each attack category is an ordered list of regex signatures. Inside a
//! category the first matching signature wins; categories are evaluated
//! independently, so one scan yields at most one detection per category.
//!
//! The detector is pure apart from the rapid-request counter: auditing of
//! detections is done by the `IntrusionPipeline`.

use crate::config::DetectorConfig;
use crate::error::{Result, SentinelError};
use crate::rate::SlidingWindowCounter;
use crate::types::{Actor, Origin, RiskLevel, ThreatDetection, ThreatType};
use chrono::{DateTime, FixedOffset, Local, Timelike, Utc};
use regex::Regex;
use std::borrow::Cow;
use std::time::Duration;

const SQL_INJECTION_SIGNATURES: &[(&str, &str)] = &[
    ("UNION SELECT", r"(?i)\bunion\b\s+(?:all\s+)?select\b"),
    ("OR/AND tautology", r#"(?i)'\s*(?:or|and)\s+'?\w+'?\s*=\s*'?\w+"#),
    ("numeric tautology", r"(?i)\b(?:or|and)\s+\d+\s*=\s*\d+"),
    ("comment after quote", r"(?i)'\s*(?:--|#|/\*)"),
    ("stacked query", r"(?i);\s*(?:drop|delete|insert|update|truncate|alter|create|exec)\b"),
    (
        "SQL statement",
        r"(?i)\bdrop\s+table\s+(?:if\s+exists\s+)?[\w.]+\s*(?:;|--|$)|\binsert\s+into\s+[\w.]+\s*(?:\(|values\b|select\b)|\bdelete\s+from\s+[\w.]+\s*(?:where\b|;)|\bselect\s+(?:\*|[\w.]+(?:\s*,\s*[\w.]+)+)\s+from\s+\w|\bselect\s+[\w.]+\s+from\s+[\w.]+\s+where\b",
    ),
    ("stored procedure", r"(?i)\bexec(?:ute)?\s*\(?\s*(?:xp_|sp_)"),
    ("time-based blind", r"(?i)\b(?:sleep|pg_sleep|benchmark)\s*\(\s*\d+|\bwaitfor\s+delay\b"),
    ("schema enumeration", r"(?i)\binformation_schema\b"),
];

const XSS_SIGNATURES: &[(&str, &str)] = &[
    ("script tag", r"(?i)<\s*/?\s*script\b[^>]*>"),
    ("javascript: URI", r"(?i)javascript\s*:"),
    (
        "inline event handler",
        r"(?i)\bon(?:error|load|click|dblclick|mouse\w*|focus|blur|submit|change|input|key\w*|abort|unload|toggle|pointer\w*|animation\w*)\s*=",
    ),
    (
        "DOM sink",
        r"(?i)document\s*\.\s*(?:cookie|write|writeln|domain|location)|\.\s*innerhtml\s*=|window\s*\.\s*location",
    ),
    ("eval call", r"(?i)\beval\s*\("),
    (
        "embedded active content",
        r#"(?i)<\s*(?:iframe|object|embed|svg|img)\b[^>]*\b(?:src|data)\s*=\s*['"]?\s*(?:javascript|data):"#,
    ),
];

const PATH_TRAVERSAL_SIGNATURES: &[(&str, &str)] = &[
    ("dot-dot-slash", r"\.\./|\.\.\\"),
    ("encoded traversal", r"(?i)%2e%2e(?:%2f|%5c|/|\\)|\.\.(?:%2f|%5c)|%2e\.(?:/|%2f)|\.%2e(?:/|%2f)"),
    ("double-encoded traversal", r"(?i)%252e%252e|%252f\.\.|\.\.%252f"),
    ("overlong UTF-8 traversal", r"(?i)\.\.%c0%af|\.\.%c1%9c"),
];

const COMMAND_INJECTION_SIGNATURES: &[(&str, &str)] = &[
    (
        "chained shell command",
        r"(?i)(?:;|&&|\|\||\||&|`)\s*(?:cat|ls|id|whoami|uname|pwd|wget|curl|nc|ncat|netcat|bash|sh|zsh|python\d?|perl|ruby|php|rm|chmod|chown)(?:\s|$|[;|&<>])",
    ),
    ("subshell", r"\$\([^)]*\)|`[^`]+`"),
    ("redirection into path", r">{1,2}\s*/(?:tmp|etc|var|dev|home|root|usr)/"),
    (
        "exfiltration tool",
        r"(?i)\b(?:curl|wget)\s+(?:-{1,2}[\w-]+\s+)*(?:https?|ftp)://|\b(?:nc|ncat|netcat)\s+(?:-\w+\s+)*[\w.-]+\s+\d{1,5}\b|/dev/tcp/",
    ),
];

const USER_AGENT_SIGNATURES: &[(&str, &str)] = &[
    ("SQL injection tool", r"(?i)\b(?:sqlmap|havij)\b"),
    (
        "vulnerability scanner",
        r"(?i)\b(?:nikto|nessus|openvas|acunetix|w3af|nuclei|burp\w*|owasp\s+zap|zgrab)\b",
    ),
    ("port scanner", r"(?i)\b(?:nmap|masscan)\b"),
    ("content brute-forcer", r"(?i)\b(?:dirbuster|gobuster|wfuzz|ffuf|hydra)\b"),
    ("exploitation framework", r"(?i)\bmetasploit\b"),
];

/// One named signature
#[derive(Debug, Clone)]
pub struct Signature {
    pub name: String,
    regex: Regex,
}

impl Signature {
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self> {
        let name = name.into();
        let regex = Regex::new(pattern).map_err(|e| SentinelError::InvalidPattern {
            signature: name.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self { name, regex })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

/// Ordered signatures for one attack category
#[derive(Debug, Clone)]
pub struct SignatureSet {
    pub threat_type: ThreatType,
    pub severity: RiskLevel,
    signatures: Vec<Signature>,
}

impl SignatureSet {
    fn compile(
        threat_type: ThreatType,
        severity: RiskLevel,
        table: &[(&str, &str)],
    ) -> Result<Self> {
        let signatures = table
            .iter()
            .map(|(name, pattern)| Signature::new(*name, pattern))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            threat_type,
            severity,
            signatures,
        })
    }

    /// First signature matching any of `inputs`, in signature order
    pub fn first_match<'a>(&'a self, inputs: &[&str]) -> Option<&'a Signature> {
        self.signatures
            .iter()
            .find(|sig| inputs.iter().any(|text| sig.is_match(text)))
    }

    pub fn push(&mut self, signature: Signature) {
        self.signatures.push(signature);
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Evaluate labelled inputs; evidence names the signature and the field
    fn check(&self, inputs: &[(&str, Cow<'_, str>)]) -> ThreatDetection {
        for sig in &self.signatures {
            if let Some((field, _)) = inputs.iter().find(|(_, text)| sig.is_match(text)) {
                return ThreatDetection::detected(
                    self.threat_type,
                    self.severity,
                    format!("{} matched in {}", sig.name, field),
                );
            }
        }
        ThreatDetection::clear(self.threat_type)
    }
}

/// Request material submitted for scanning
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub url: Option<String>,
    pub body: Option<String>,
    pub user_agent: Option<String>,

    /// Role of the acting user
    pub role: Option<String>,

    /// Passed through to audit events raised by the scan
    pub actor: Option<Actor>,
    pub origin: Option<Origin>,

    /// Evaluation instant; defaults to now
    pub at: Option<DateTime<Utc>>,
}

impl ScanRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = Some(at);
        self
    }

    fn origin_ip(&self) -> Option<&str> {
        self.origin.as_ref().and_then(|o| o.ip_address.as_deref())
    }
}

/// Signature-based threat detector
pub struct ThreatDetector {
    sql_injection: SignatureSet,
    xss: SignatureSet,
    path_traversal: SignatureSet,
    command_injection: SignatureSet,
    user_agent: SignatureSet,
    config: DetectorConfig,
    rapid_requests: SlidingWindowCounter,
}

impl ThreatDetector {
    /// Compile the built-in signature sets
    pub fn new(config: DetectorConfig) -> Result<Self> {
        let rapid_requests = SlidingWindowCounter::new(
            config.rapid_request_limit,
            Duration::from_secs(config.rapid_request_window_secs),
        );

        Ok(Self {
            sql_injection: SignatureSet::compile(
                ThreatType::SqlInjection,
                RiskLevel::Critical,
                SQL_INJECTION_SIGNATURES,
            )?,
            xss: SignatureSet::compile(ThreatType::Xss, RiskLevel::High, XSS_SIGNATURES)?,
            path_traversal: SignatureSet::compile(
                ThreatType::PathTraversal,
                RiskLevel::High,
                PATH_TRAVERSAL_SIGNATURES,
            )?,
            command_injection: SignatureSet::compile(
                ThreatType::CommandInjection,
                RiskLevel::Critical,
                COMMAND_INJECTION_SIGNATURES,
            )?,
            user_agent: SignatureSet::compile(
                ThreatType::SuspiciousUserAgent,
                RiskLevel::High,
                USER_AGENT_SIGNATURES,
            )?,
            config,
            rapid_requests,
        })
    }

    /// Detector with default configuration
    pub fn with_defaults() -> Result<Self> {
        Self::new(DetectorConfig::default())
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Append a custom signature to a category; it is evaluated after the built-ins
    pub fn add_signature(&mut self, threat_type: ThreatType, name: &str, pattern: &str) -> Result<()> {
        let set = match threat_type {
            ThreatType::SqlInjection => &mut self.sql_injection,
            ThreatType::Xss => &mut self.xss,
            ThreatType::PathTraversal => &mut self.path_traversal,
            ThreatType::CommandInjection => &mut self.command_injection,
            ThreatType::SuspiciousUserAgent => &mut self.user_agent,
            other => {
                return Err(SentinelError::Config(format!(
                    "{} is not a signature-based category",
                    other
                )))
            }
        };
        set.push(Signature::new(name, pattern)?);
        Ok(())
    }

    /// Signature set for a category, if it is signature-based
    pub fn signatures(&self, threat_type: ThreatType) -> Option<&SignatureSet> {
        match threat_type {
            ThreatType::SqlInjection => Some(&self.sql_injection),
            ThreatType::Xss => Some(&self.xss),
            ThreatType::PathTraversal => Some(&self.path_traversal),
            ThreatType::CommandInjection => Some(&self.command_injection),
            ThreatType::SuspiciousUserAgent => Some(&self.user_agent),
            ThreatType::AfterHoursAccess
            | ThreatType::RapidRequests
            | ThreatType::InvalidInput
            | ThreatType::AuthenticationAnomaly => None,
        }
    }

    /// Run every category against the request; returns only positive detections
    pub fn scan(&self, request: &ScanRequest) -> Vec<ThreatDetection> {
        let at = request.at.unwrap_or_else(Utc::now);

        let mut checks = vec![
            self.check_sql_injection(request),
            self.check_xss(request),
            self.check_path_traversal(request),
            self.check_command_injection(request),
            self.check_user_agent(request),
            self.check_after_hours(request.role.as_deref(), at),
            self.check_input_limits(request),
        ];
        if let Some(ip) = request.origin_ip() {
            checks.push(self.check_rapid_requests(ip));
        }

        let detections: Vec<ThreatDetection> = checks.into_iter().filter(|d| d.detected).collect();

        if !detections.is_empty() {
            tracing::debug!(
                count = detections.len(),
                threats = ?detections.iter().map(|d| d.threat_type).collect::<Vec<_>>(),
                "Threats detected"
            );
        }

        detections
    }

    /// SQL injection over url and body, raw and percent-decoded
    pub fn check_sql_injection(&self, request: &ScanRequest) -> ThreatDetection {
        self.sql_injection.check(&decoded_inputs(request))
    }

    /// XSS over url and body, raw and percent-decoded
    pub fn check_xss(&self, request: &ScanRequest) -> ThreatDetection {
        self.xss.check(&decoded_inputs(request))
    }

    /// Path traversal over raw url and body
    pub fn check_path_traversal(&self, request: &ScanRequest) -> ThreatDetection {
        self.path_traversal.check(&raw_inputs(request))
    }

    /// Command injection over the body only
    pub fn check_command_injection(&self, request: &ScanRequest) -> ThreatDetection {
        match request.body.as_deref() {
            Some(body) => self
                .command_injection
                .check(&[("body", Cow::Borrowed(body))]),
            None => ThreatDetection::clear(ThreatType::CommandInjection),
        }
    }

    pub fn check_user_agent(&self, request: &ScanRequest) -> ThreatDetection {
        match request.user_agent.as_deref() {
            Some(ua) => self.user_agent.check(&[("user agent", Cow::Borrowed(ua))]),
            None => ThreatDetection::clear(ThreatType::SuspiciousUserAgent),
        }
    }

    /// Administrative access inside the after-hours window
    pub fn check_after_hours(&self, role: Option<&str>, at: DateTime<Utc>) -> ThreatDetection {
        let is_admin = role
            .map(|r| {
                self.config
                    .admin_roles
                    .iter()
                    .any(|admin| admin.eq_ignore_ascii_case(r.trim()))
            })
            .unwrap_or(false);
        if !is_admin {
            return ThreatDetection::clear(ThreatType::AfterHoursAccess);
        }

        let hour = self.local_hour(at);
        if self.in_after_hours_window(hour) {
            ThreatDetection::detected(
                ThreatType::AfterHoursAccess,
                RiskLevel::Medium,
                format!(
                    "administrative access at {:02}:00, outside {:02}:00-{:02}:00 quiet hours",
                    hour, self.config.after_hours_start, self.config.after_hours_end
                ),
            )
        } else {
            ThreatDetection::clear(ThreatType::AfterHoursAccess)
        }
    }

    /// Oversized or NUL-bearing url/body
    pub fn check_input_limits(&self, request: &ScanRequest) -> ThreatDetection {
        let max = self.config.max_input_bytes;
        for (field, value) in [("url", &request.url), ("body", &request.body)] {
            let Some(value) = value.as_deref() else {
                continue;
            };
            if value.len() > max {
                return ThreatDetection::detected(
                    ThreatType::InvalidInput,
                    RiskLevel::Medium,
                    format!("{} is {} bytes, limit is {}", field, value.len(), max),
                );
            }
            if value.contains('\0') {
                return ThreatDetection::detected(
                    ThreatType::InvalidInput,
                    RiskLevel::Medium,
                    format!("NUL byte in {}", field),
                );
            }
        }
        ThreatDetection::clear(ThreatType::InvalidInput)
    }

    /// Count a request from `ip` and flag bursts above the configured rate
    pub fn check_rapid_requests(&self, ip: &str) -> ThreatDetection {
        let count = self.rapid_requests.hit(ip);
        if !self.rapid_requests.is_exceeded(count) {
            return ThreatDetection::clear(ThreatType::RapidRequests);
        }

        let severity = if count > self.rapid_requests.limit() * 2 {
            RiskLevel::High
        } else {
            RiskLevel::Medium
        };
        ThreatDetection::detected(
            ThreatType::RapidRequests,
            severity,
            format!(
                "{} requests from one origin within {}s",
                count, self.config.rapid_request_window_secs
            ),
        )
    }

    fn local_hour(&self, at: DateTime<Utc>) -> u32 {
        match self
            .config
            .utc_offset_minutes
            .and_then(|m| FixedOffset::east_opt(m * 60))
        {
            Some(offset) => at.with_timezone(&offset).hour(),
            None => at.with_timezone(&Local).hour(),
        }
    }

    fn in_after_hours_window(&self, hour: u32) -> bool {
        let (start, end) = (self.config.after_hours_start, self.config.after_hours_end);
        if start > end {
            hour >= start || hour < end
        } else {
            hour >= start && hour < end
        }
    }
}

/// Block on any CRITICAL detection, and on any SQL injection regardless of severity
pub fn should_block(detections: &[ThreatDetection]) -> bool {
    detections.iter().any(|d| {
        d.detected && (d.severity == RiskLevel::Critical || d.threat_type == ThreatType::SqlInjection)
    })
}

fn raw_inputs(request: &ScanRequest) -> Vec<(&'static str, Cow<'_, str>)> {
    let mut inputs = Vec::with_capacity(2);
    if let Some(url) = request.url.as_deref() {
        inputs.push(("url", Cow::Borrowed(url)));
    }
    if let Some(body) = request.body.as_deref() {
        inputs.push(("body", Cow::Borrowed(body)));
    }
    inputs
}

fn decoded_inputs(request: &ScanRequest) -> Vec<(&'static str, Cow<'_, str>)> {
    let mut inputs = raw_inputs(request);
    // Invalid UTF-8 after decoding is replaced, never a reason to skip the pass
    let decoded: Vec<_> = inputs
        .iter()
        .filter_map(|(field, text)| {
            let bytes = urlencoding::decode_binary(text.as_bytes());
            let decoded = String::from_utf8_lossy(&bytes);
            (decoded.as_ref() != text.as_ref()).then(|| (*field, Cow::Owned(decoded.into_owned())))
        })
        .collect();
    inputs.extend(decoded);
    inputs
}
