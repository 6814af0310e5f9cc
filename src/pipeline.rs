//! Intrusion pipeline: detector, recorder and escalator wired together
//!
//! `scan` runs the threat detector over one inbound request, audits every
//! HIGH or CRITICAL detection as a `SUSPICIOUS_ACTIVITY` event, and returns
//! the block/allow verdict. Business operations are recorded through the
//! same recorder, whose CRITICAL events reach the escalator's dispatch
//! worker without the caller waiting on channel delivery.

use crate::config::SentinelConfig;
use crate::crypto::DetailsEncryptor;
use crate::detector::{should_block, ScanRequest, ThreatDetector};
use crate::error::{Result, SentinelError};
use crate::escalator::{AlertEscalator, EscalationHandle, NotificationChannel};
use crate::recorder::{AuditRecorder, IncidentKind};
use crate::rate::SlidingWindowCounter;
use crate::store::memory::MemoryAuditStore;
use crate::store::nats::NatsAuditStore;
use crate::store::AuditStore;
use crate::types::{
    Actor, Origin, PhiAction, RiskLevel, SecurityEvent, SecurityEventType, ThreatDetection,
    ThreatType,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Longest url copied into an audit event's details
const MAX_AUDITED_URL_CHARS: usize = 2048;

/// Outcome of scanning one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanVerdict {
    /// Positive detections, at most one per category
    pub detections: Vec<ThreatDetection>,

    /// The request should be rejected with a generic error
    pub blocked: bool,
}

impl ScanVerdict {
    pub fn is_clean(&self) -> bool {
        self.detections.is_empty()
    }

    pub fn highest_severity(&self) -> Option<RiskLevel> {
        self.detections.iter().map(|d| d.severity).max()
    }
}

/// Builder for `IntrusionPipeline`
pub struct PipelineBuilder {
    config: SentinelConfig,
    store: Option<Arc<dyn AuditStore>>,
    channels: Vec<Arc<dyn NotificationChannel>>,
    encryptor: Option<Arc<dyn DetailsEncryptor>>,
}

impl PipelineBuilder {
    /// Audit store to append to; defaults to JetStream when `nats` is
    /// configured, otherwise an in-memory store
    pub fn store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn encryptor(mut self, encryptor: Arc<dyn DetailsEncryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    /// Validate configuration, connect the store and start the escalation worker
    ///
    /// Must be awaited inside a Tokio runtime.
    pub async fn build(self) -> Result<IntrusionPipeline> {
        let config = self.config;
        config.validate()?;

        if config.audit.encrypt_phi_details && self.encryptor.is_none() {
            return Err(SentinelError::Config(
                "audit.encryptPhiDetails is set but no encryptor was supplied".to_string(),
            ));
        }

        let store: Arc<dyn AuditStore> = match (self.store, &config.nats) {
            (Some(store), _) => store,
            (None, Some(nats)) => Arc::new(NatsAuditStore::connect(nats.clone()).await?),
            (None, None) => Arc::new(MemoryAuditStore::new()),
        };

        let detector = ThreatDetector::new(config.detector.clone())?;
        let escalator = AlertEscalator::new(config.alerting.clone(), self.channels);
        let dispatcher = escalator.start_dispatcher();

        let mut recorder = AuditRecorder::new(store, config.audit.clone())
            .with_escalation(Arc::new(dispatcher.clone()));
        if let Some(encryptor) = self.encryptor {
            recorder = recorder.with_encryptor(encryptor);
        }

        let failed_logins = SlidingWindowCounter::new(
            config.alerting.failed_login_limit,
            Duration::from_secs(config.alerting.failed_login_window_secs),
        );

        tracing::info!(
            store = %recorder.store().name(),
            encrypt_phi_details = config.audit.encrypt_phi_details,
            "Intrusion pipeline ready"
        );

        Ok(IntrusionPipeline {
            config,
            detector,
            recorder,
            escalator,
            dispatcher,
            failed_logins,
        })
    }
}

/// Composition root of the security observability pipeline
pub struct IntrusionPipeline {
    config: SentinelConfig,
    detector: ThreatDetector,
    recorder: AuditRecorder,
    escalator: AlertEscalator,
    dispatcher: EscalationHandle,

    /// Failed logins keyed by lower-cased email
    failed_logins: SlidingWindowCounter,
}

impl IntrusionPipeline {
    pub fn builder(config: SentinelConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            store: None,
            channels: Vec::new(),
            encryptor: None,
        }
    }

    /// Scan one request, audit serious detections, and decide whether to block
    pub async fn scan(&self, request: &ScanRequest) -> ScanVerdict {
        let detections = self.detector.scan(request);

        for detection in detections.iter().filter(|d| d.severity >= RiskLevel::High) {
            let mut event = detection_event(detection, request.actor.clone(), request.origin.clone());
            if let Some(url) = request.url.as_deref() {
                event = event.with_detail("url", truncate_chars(url, MAX_AUDITED_URL_CHARS));
            }
            self.recorder.record(event).await;
        }

        let blocked = should_block(&detections);
        if blocked {
            tracing::warn!(
                threats = ?detections.iter().map(|d| d.threat_type).collect::<Vec<_>>(),
                ip = request.origin.as_ref().and_then(|o| o.ip_address.as_deref()).unwrap_or("-"),
                "Request blocked"
            );
        }

        ScanVerdict {
            detections,
            blocked,
        }
    }

    /// Record an arbitrary event
    pub async fn record(&self, event: SecurityEvent) -> SecurityEvent {
        self.recorder.record(event).await
    }

    pub async fn record_phi_access(
        &self,
        actor: Option<Actor>,
        organization_id: Option<&str>,
        resource_type: &str,
        resource_id: &str,
        action: PhiAction,
        origin: Option<Origin>,
    ) -> SecurityEvent {
        self.recorder
            .record_phi_access(actor, organization_id, resource_type, resource_id, action, origin)
            .await
    }

    /// Record a login attempt and track repeated failures per email
    ///
    /// Reaching `failedLoginLimit` failures inside the window records an
    /// `AUTHENTICATION_ANOMALY` suspicious-activity event and restarts the count.
    /// A successful login clears the count.
    pub async fn record_login_attempt(
        &self,
        success: bool,
        email: &str,
        actor: Option<Actor>,
        origin: Option<Origin>,
        failure_reason: Option<&str>,
    ) -> SecurityEvent {
        let event = self
            .recorder
            .record_login_attempt(success, email, actor, origin, failure_reason)
            .await;

        let key = email.trim().to_ascii_lowercase();
        if success {
            self.failed_logins.reset(&key);
            return event;
        }

        let failures = self.failed_logins.hit(&key);
        if failures >= self.failed_logins.limit() {
            self.failed_logins.reset(&key);

            let detection = ThreatDetection::detected(
                ThreatType::AuthenticationAnomaly,
                RiskLevel::High,
                format!(
                    "{} failed logins within {}s",
                    failures, self.config.alerting.failed_login_window_secs
                ),
            );
            tracing::warn!(failures, "Authentication anomaly detected");
            self.recorder
                .record(detection_event(&detection, event.actor.clone(), event.origin.clone()))
                .await;
        }

        event
    }

    pub async fn record_security_event(
        &self,
        kind: IncidentKind,
        details: BTreeMap<String, serde_json::Value>,
        actor: Option<Actor>,
        origin: Option<Origin>,
    ) -> SecurityEvent {
        self.recorder
            .record_security_event(kind, details, actor, origin)
            .await
    }

    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    pub fn detector(&self) -> &ThreatDetector {
        &self.detector
    }

    pub fn recorder(&self) -> &AuditRecorder {
        &self.recorder
    }

    pub fn escalator(&self) -> &AlertEscalator {
        &self.escalator
    }

    /// False once the escalation worker has stopped
    pub fn is_dispatching(&self) -> bool {
        !self.dispatcher.is_closed()
    }
}

/// Fold a detection into a `SUSPICIOUS_ACTIVITY` event at the detection's severity
fn detection_event(
    detection: &ThreatDetection,
    actor: Option<Actor>,
    origin: Option<Origin>,
) -> SecurityEvent {
    let mut event = SecurityEvent::new(SecurityEventType::SuspiciousActivity)
        .with_risk_level(detection.severity)
        .with_detail("threatType", detection.threat_type.as_str())
        .with_detail("severity", detection.severity.as_str())
        .with_detail("evidence", detection.evidence.clone());
    event.actor = actor;
    event.origin = origin;
    event
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlertingConfig;

    fn config() -> SentinelConfig {
        SentinelConfig {
            alerting: AlertingConfig {
                failed_login_limit: 3,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn pipeline() -> (MemoryAuditStore, IntrusionPipeline) {
        let store = MemoryAuditStore::new();
        let pipeline = IntrusionPipeline::builder(config())
            .store(Arc::new(store.clone()))
            .build()
            .await
            .unwrap();
        (store, pipeline)
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("ab", 3), "ab");
        assert_eq!(truncate_chars("ééé", 2), "éé");
    }

    #[tokio::test]
    async fn test_build_rejects_encryption_without_key() {
        let mut config = SentinelConfig::default();
        config.audit.encrypt_phi_details = true;
        assert!(IntrusionPipeline::builder(config).build().await.is_err());
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = SentinelConfig::default();
        config.alerting.buffer_capacity = 0;
        assert!(IntrusionPipeline::builder(config).build().await.is_err());
    }

    #[tokio::test]
    async fn test_build_defaults_to_memory_store() {
        let pipeline = IntrusionPipeline::builder(SentinelConfig::default())
            .build()
            .await
            .unwrap();
        assert_eq!(pipeline.recorder().store().name(), "memory");
        assert!(pipeline.is_dispatching());
    }

    #[tokio::test]
    async fn test_medium_detection_returned_but_not_audited() {
        let (store, pipeline) = pipeline().await;
        let request = ScanRequest::new().with_body("a\0b");

        let verdict = pipeline.scan(&request).await;
        assert_eq!(verdict.detections.len(), 1);
        assert_eq!(verdict.detections[0].threat_type, ThreatType::InvalidInput);
        assert!(!verdict.blocked);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_high_detection_audited_not_blocked() {
        let (store, pipeline) = pipeline().await;
        let request = ScanRequest::new()
            .with_body("<img src=x onerror=alert(1)>")
            .with_origin(Origin::ip("192.0.2.10"));

        let verdict = pipeline.scan(&request).await;
        assert!(!verdict.blocked);
        assert_eq!(verdict.highest_severity(), Some(RiskLevel::High));

        let events = store.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, SecurityEventType::SuspiciousActivity);
        assert_eq!(events[0].risk_level, Some(RiskLevel::High));
        assert_eq!(events[0].details["threatType"], "XSS");
        assert_eq!(events[0].origin_ip(), Some("192.0.2.10"));
        assert!(!events[0].details.contains_key("url"));
    }

    #[tokio::test]
    async fn test_failed_logins_raise_anomaly() {
        let (store, pipeline) = pipeline().await;

        for _ in 0..2 {
            pipeline
                .record_login_attempt(false, "Doc@Clinic.test", None, None, Some("bad_password"))
                .await;
        }
        assert_eq!(store.len().await, 2);

        pipeline
            .record_login_attempt(false, "doc@clinic.test", None, None, Some("bad_password"))
            .await;

        let events = store.events().await;
        assert_eq!(events.len(), 4);
        let anomaly = &events[3];
        assert_eq!(anomaly.event_type, SecurityEventType::SuspiciousActivity);
        assert_eq!(anomaly.details["threatType"], "AUTHENTICATION_ANOMALY");
        assert_eq!(anomaly.risk_level, Some(RiskLevel::High));
        assert_eq!(anomaly.actor_email(), Some("doc@clinic.test"));
    }

    #[tokio::test]
    async fn test_successful_login_clears_failures() {
        let (store, pipeline) = pipeline().await;

        for _ in 0..2 {
            pipeline
                .record_login_attempt(false, "nurse@clinic.test", None, None, None)
                .await;
        }
        pipeline
            .record_login_attempt(true, "nurse@clinic.test", None, None, None)
            .await;
        pipeline
            .record_login_attempt(false, "nurse@clinic.test", None, None, None)
            .await;

        let events = store.events().await;
        assert_eq!(events.len(), 4);
        assert!(events
            .iter()
            .all(|e| e.event_type != SecurityEventType::SuspiciousActivity));
    }
}
