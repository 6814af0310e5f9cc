//! Audit recorder: stamps, classifies and persists security events
//!
//! `AuditRecorder::record` never fails. Store errors and slow appends are
//! logged and counted, then dropped, so an audit-log outage cannot turn into
//! an outage of the operation being audited. CRITICAL events are handed to
//! an `EscalationSink` without waiting for dispatch.
//!
//! Appends are performed by a single worker task fed through an ordered
//! queue, so store order follows call order. A caller waits for its own
//! append for at most `appendTimeoutMs`, however many appends are queued
//! ahead of it.

use crate::config::AuditConfig;
use crate::crypto::DetailsEncryptor;
use crate::error::SentinelError;
use crate::escalator::EscalationSink;
use crate::store::AuditStore;
use crate::taxonomy;
use crate::types::{
    next_timestamp, Actor, Origin, PhiAction, RiskLevel, SecurityEvent, SecurityEventType,
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Incident categories accepted by `record_security_event`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncidentKind {
    UnauthorizedAccess,
    SuspiciousActivity,
    BreachSuspected,
    RateLimitExceeded,
}

impl IncidentKind {
    pub fn event_type(&self) -> SecurityEventType {
        match self {
            Self::UnauthorizedAccess => SecurityEventType::UnauthorizedAccess,
            Self::SuspiciousActivity => SecurityEventType::SuspiciousActivity,
            Self::BreachSuspected => SecurityEventType::BreachSuspected,
            Self::RateLimitExceeded => SecurityEventType::RateLimitExceeded,
        }
    }

    /// CRITICAL for a suspected breach, HIGH for everything else
    pub fn risk(&self) -> RiskLevel {
        match self {
            Self::BreachSuspected => RiskLevel::Critical,
            _ => RiskLevel::High,
        }
    }
}

/// Recorder counters
#[derive(Debug, Default)]
pub struct RecorderMetrics {
    recorded: AtomicU64,
    appended: AtomicU64,
    append_failures: AtomicU64,
    escalated: AtomicU64,
    encrypted: AtomicU64,
}

impl RecorderMetrics {
    pub fn snapshot(&self) -> RecorderMetricsSnapshot {
        RecorderMetricsSnapshot {
            recorded: self.recorded.load(Ordering::Relaxed),
            appended: self.appended.load(Ordering::Relaxed),
            append_failures: self.append_failures.load(Ordering::Relaxed),
            escalated: self.escalated.load(Ordering::Relaxed),
            encrypted: self.encrypted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `RecorderMetrics`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderMetricsSnapshot {
    pub recorded: u64,
    pub appended: u64,
    pub append_failures: u64,
    pub escalated: u64,
    pub encrypted: u64,
}

/// A stamped event waiting for the append worker
struct AppendJob {
    event: SecurityEvent,
    done: oneshot::Sender<()>,
}

/// Normalizes and persists security events
pub struct AuditRecorder {
    store: Arc<dyn AuditStore>,
    sink: Option<Arc<dyn EscalationSink>>,
    encryptor: Option<Arc<dyn DetailsEncryptor>>,
    config: AuditConfig,
    metrics: Arc<RecorderMetrics>,

    /// Held across stamping and enqueueing so queue order matches call order
    queue: Mutex<mpsc::UnboundedSender<AppendJob>>,
}

impl AuditRecorder {
    /// Create a recorder and spawn its append worker
    ///
    /// Must be called within a Tokio runtime. The worker drains the queue
    /// and exits once the recorder is dropped.
    pub fn new(store: Arc<dyn AuditStore>, config: AuditConfig) -> Self {
        let metrics = Arc::new(RecorderMetrics::default());
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(run_append_worker(
            rx,
            store.clone(),
            metrics.clone(),
            Duration::from_millis(config.append_timeout_ms),
        ));

        Self {
            store,
            sink: None,
            encryptor: None,
            config,
            metrics,
            queue: Mutex::new(tx),
        }
    }

    /// Route CRITICAL events to `sink`
    pub fn with_escalation(mut self, sink: Arc<dyn EscalationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Seal the details of PHI events before they reach the store
    pub fn with_encryptor(mut self, encryptor: Arc<dyn DetailsEncryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn store(&self) -> &dyn AuditStore {
        self.store.as_ref()
    }

    pub fn metrics(&self) -> &RecorderMetrics {
        &self.metrics
    }

    /// Stamp, classify, append and, for CRITICAL events, escalate
    ///
    /// Returns the event as recorded, with `timestamp` and `risk_level` set.
    /// The store copy of a PHI event may carry encrypted details; the
    /// returned event and the escalated one never do.
    pub async fn record(&self, mut event: SecurityEvent) -> SecurityEvent {
        self.metrics.recorded.fetch_add(1, Ordering::Relaxed);

        let appended = {
            let queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

            if event.timestamp.is_none() {
                event.timestamp = Some(next_timestamp());
            }
            if event.risk_level.is_none() {
                event.risk_level = Some(taxonomy::classify(&event.event_type));
            }

            let stored = self.prepare_for_store(&event).into_owned();
            let (done, appended) = oneshot::channel();
            match queue.send(AppendJob { event: stored, done }) {
                Ok(()) => Some(appended),
                Err(_) => {
                    self.metrics.append_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(event_id = %event.id, "Append worker stopped, audit event dropped");
                    None
                }
            }
        };

        if let Some(appended) = appended {
            let timeout = Duration::from_millis(self.config.append_timeout_ms);
            if tokio::time::timeout(timeout, appended).await.is_err() {
                tracing::debug!(
                    event_id = %event.id,
                    store = %self.store.name(),
                    "Audit append still pending, not waiting"
                );
            }
        }

        if event.risk() == RiskLevel::Critical {
            self.escalate(&event);
        }

        event
    }

    /// Record an operation on a PHI-bearing resource
    ///
    /// The event type is composed from `resource_type` and `action`
    /// (`patient` + `View` gives `PATIENT_VIEW`); `phi_accessed` is always set.
    pub async fn record_phi_access(
        &self,
        actor: Option<Actor>,
        organization_id: Option<&str>,
        resource_type: &str,
        resource_id: &str,
        action: PhiAction,
        origin: Option<Origin>,
    ) -> SecurityEvent {
        let mut event = SecurityEvent::new(SecurityEventType::phi(resource_type, action))
            .with_resource(resource_type, resource_id)
            .with_detail("action", action.as_str())
            .with_phi_accessed(true);
        event.actor = actor;
        event.organization_id = organization_id.map(str::to_string);
        event.origin = origin;

        self.record(event).await
    }

    /// Record a login attempt: LOW on success, MEDIUM on failure
    pub async fn record_login_attempt(
        &self,
        success: bool,
        email: &str,
        actor: Option<Actor>,
        origin: Option<Origin>,
        failure_reason: Option<&str>,
    ) -> SecurityEvent {
        let (event_type, risk) = if success {
            (SecurityEventType::LoginSuccess, RiskLevel::Low)
        } else {
            (SecurityEventType::LoginFailure, RiskLevel::Medium)
        };

        let mut actor = actor.unwrap_or_default();
        if actor.email.is_none() {
            actor.email = Some(email.to_string());
        }

        let mut event = SecurityEvent::new(event_type)
            .with_actor(actor)
            .with_risk_level(risk);
        event.origin = origin;
        if let Some(reason) = failure_reason {
            event = event.with_detail("failureReason", reason);
        }

        self.record(event).await
    }

    /// Record a security incident with caller-supplied details
    pub async fn record_security_event(
        &self,
        kind: IncidentKind,
        details: BTreeMap<String, serde_json::Value>,
        actor: Option<Actor>,
        origin: Option<Origin>,
    ) -> SecurityEvent {
        let mut event = SecurityEvent::new(kind.event_type()).with_risk_level(kind.risk());
        event.details = details;
        event.actor = actor;
        event.origin = origin;

        self.record(event).await
    }

    fn prepare_for_store<'a>(&self, event: &'a SecurityEvent) -> Cow<'a, SecurityEvent> {
        let Some(encryptor) = self.encryptor.as_ref().filter(|_| event.phi_accessed) else {
            return Cow::Borrowed(event);
        };

        match encryptor.seal_event(event) {
            Ok(sealed) => {
                self.metrics.encrypted.fetch_add(1, Ordering::Relaxed);
                Cow::Owned(sealed)
            }
            Err(e) => {
                tracing::warn!(
                    event_id = %event.id,
                    error = %e,
                    "Failed to encrypt PHI details, storing redacted"
                );
                let mut redacted = event.clone();
                redacted.details = BTreeMap::from([(
                    "redacted".to_string(),
                    serde_json::Value::Bool(true),
                )]);
                Cow::Owned(redacted)
            }
        }
    }

    fn escalate(&self, event: &SecurityEvent) {
        let Some(sink) = &self.sink else {
            tracing::debug!(event_id = %event.id, "No escalation sink, CRITICAL event not escalated");
            return;
        };

        match sink.submit(event.clone()) {
            Ok(()) => {
                self.metrics.escalated.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::error!(event_id = %event.id, error = %e, "Failed to submit event for escalation");
            }
        }
    }
}

/// Append queued events one at a time, each bounded by `timeout`
async fn run_append_worker(
    mut rx: mpsc::UnboundedReceiver<AppendJob>,
    store: Arc<dyn AuditStore>,
    metrics: Arc<RecorderMetrics>,
    timeout: Duration,
) {
    while let Some(AppendJob { event, done }) = rx.recv().await {
        let outcome = match tokio::time::timeout(timeout, store.append(&event)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(SentinelError::Timeout(format!(
                "append exceeded {}ms",
                timeout.as_millis()
            ))),
        };

        match outcome {
            Ok(sequence) => {
                metrics.appended.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    sequence,
                    "Audit event appended"
                );
            }
            Err(e) => {
                metrics.append_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    store = %store.name(),
                    error = %e,
                    "Failed to append audit event"
                );
            }
        }

        let _ = done.send(());
    }

    tracing::debug!(store = %store.name(), "Append worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Aes256GcmEncryptor, EncryptedDetails};
    use crate::error::Result;
    use crate::store::memory::MemoryAuditStore;
    use crate::store::StoreInfo;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct FailingStore;

    #[async_trait]
    impl AuditStore for FailingStore {
        async fn append(&self, _event: &SecurityEvent) -> Result<u64> {
            Err(SentinelError::Append {
                store: "failing".to_string(),
                reason: "connection refused".to_string(),
            })
        }

        async fn history(&self, _limit: usize) -> Result<Vec<SecurityEvent>> {
            Ok(vec![])
        }

        async fn info(&self) -> Result<StoreInfo> {
            Err(SentinelError::Store("down".to_string()))
        }

        fn name(&self) -> &str {
            "failing"
        }
    }

    struct StalledStore;

    #[async_trait]
    impl AuditStore for StalledStore {
        async fn append(&self, _event: &SecurityEvent) -> Result<u64> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(1)
        }

        async fn history(&self, _limit: usize) -> Result<Vec<SecurityEvent>> {
            Ok(vec![])
        }

        async fn info(&self) -> Result<StoreInfo> {
            Err(SentinelError::Store("stalled".to_string()))
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: StdMutex<Vec<SecurityEvent>>,
    }

    impl RecordingSink {
        fn submitted(&self) -> Vec<SecurityEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl EscalationSink for RecordingSink {
        fn submit(&self, event: SecurityEvent) -> Result<()> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    struct ClosedSink;

    impl EscalationSink for ClosedSink {
        fn submit(&self, _event: SecurityEvent) -> Result<()> {
            Err(SentinelError::DispatcherClosed)
        }
    }

    fn memory_recorder() -> (MemoryAuditStore, Arc<RecordingSink>, AuditRecorder) {
        let store = MemoryAuditStore::new();
        let sink = Arc::new(RecordingSink::default());
        let recorder = AuditRecorder::new(Arc::new(store.clone()), AuditConfig::default())
            .with_escalation(sink.clone());
        (store, sink, recorder)
    }

    #[tokio::test]
    async fn test_record_stamps_and_classifies() {
        let (store, _, recorder) = memory_recorder();

        let recorded = recorder
            .record(SecurityEvent::new(SecurityEventType::LoginFailure))
            .await;

        assert!(recorded.timestamp.is_some());
        assert_eq!(recorded.risk_level, Some(RiskLevel::Medium));

        let stored = store.events().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0], recorded);
    }

    #[tokio::test]
    async fn test_existing_timestamp_kept() {
        let (_, _, recorder) = memory_recorder();
        let recorded = recorder
            .record(SecurityEvent::new(SecurityEventType::Logout).with_timestamp(42))
            .await;
        assert_eq!(recorded.timestamp, Some(42));
    }

    #[tokio::test]
    async fn test_explicit_risk_wins() {
        let (_, sink, recorder) = memory_recorder();

        let recorded = recorder
            .record(SecurityEvent::new(SecurityEventType::Logout).with_risk_level(RiskLevel::Critical))
            .await;
        assert_eq!(recorded.risk_level, Some(RiskLevel::Critical));
        assert_eq!(sink.submitted().len(), 1);

        let recorded = recorder
            .record(
                SecurityEvent::new(SecurityEventType::BreachSuspected)
                    .with_risk_level(RiskLevel::Low),
            )
            .await;
        assert_eq!(recorded.risk_level, Some(RiskLevel::Low));
        assert_eq!(sink.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_only_critical_escalated() {
        let (_, sink, recorder) = memory_recorder();

        for event_type in [
            SecurityEventType::LoginSuccess,
            SecurityEventType::LoginFailure,
            SecurityEventType::RoleChanged,
            SecurityEventType::phi("patient", PhiAction::Export),
            SecurityEventType::UnauthorizedAccess,
            SecurityEventType::BreachSuspected,
        ] {
            recorder.record(SecurityEvent::new(event_type)).await;
        }

        let submitted = sink.submitted();
        assert_eq!(submitted.len(), 2);
        assert!(submitted.iter().all(|e| e.risk() == RiskLevel::Critical));
        assert_eq!(recorder.metrics().snapshot().escalated, 2);
    }

    #[tokio::test]
    async fn test_failing_store_never_fails_caller() {
        let sink = Arc::new(RecordingSink::default());
        let recorder = AuditRecorder::new(Arc::new(FailingStore), AuditConfig::default())
            .with_escalation(sink.clone());

        for _ in 0..3 {
            recorder
                .record(SecurityEvent::new(SecurityEventType::BreachSuspected))
                .await;
        }

        let metrics = recorder.metrics().snapshot();
        assert_eq!(metrics.recorded, 3);
        assert_eq!(metrics.appended, 0);
        assert_eq!(metrics.append_failures, 3);
        // Escalation does not depend on the append succeeding
        assert_eq!(sink.submitted().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_store_times_out() {
        let recorder = AuditRecorder::new(
            Arc::new(StalledStore),
            AuditConfig {
                append_timeout_ms: 50,
                ..Default::default()
            },
        );

        let started = tokio::time::Instant::now();
        let recorded = recorder
            .record(SecurityEvent::new(SecurityEventType::LoginSuccess))
            .await;
        assert!(recorded.timestamp.is_some());
        assert!(started.elapsed() <= Duration::from_millis(60));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(recorder.metrics().snapshot().append_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_store_wait_does_not_stack() {
        let recorder = Arc::new(AuditRecorder::new(
            Arc::new(StalledStore),
            AuditConfig::default(),
        ));
        let bound = Duration::from_millis(AuditConfig::default().append_timeout_ms + 100);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let recorder = recorder.clone();
            handles.push(tokio::spawn(async move {
                let started = tokio::time::Instant::now();
                recorder
                    .record(SecurityEvent::new(SecurityEventType::SessionStart))
                    .await;
                started.elapsed()
            }));
        }

        let mut worst = Duration::ZERO;
        for h in handles {
            worst = worst.max(h.await.unwrap());
        }
        assert!(worst <= bound, "worst caller waited {:?}", worst);
        assert_eq!(recorder.metrics().snapshot().recorded, 20);
    }

    #[tokio::test]
    async fn test_closed_sink_is_swallowed() {
        let recorder = AuditRecorder::new(Arc::new(MemoryAuditStore::new()), AuditConfig::default())
            .with_escalation(Arc::new(ClosedSink));

        recorder
            .record(SecurityEvent::new(SecurityEventType::UnauthorizedAccess))
            .await;
        assert_eq!(recorder.metrics().snapshot().escalated, 0);
        assert_eq!(recorder.metrics().snapshot().appended, 1);
    }

    #[tokio::test]
    async fn test_record_phi_access() {
        let (store, _, recorder) = memory_recorder();

        let event = recorder
            .record_phi_access(
                Some(Actor::user("u-1").with_email("doc@clinic.test")),
                Some("org-1"),
                "patient",
                "p-42",
                PhiAction::View,
                Some(Origin::ip("10.0.0.5")),
            )
            .await;

        assert_eq!(event.event_type.to_string(), "PATIENT_VIEW");
        assert!(event.phi_accessed);
        assert_eq!(event.risk_level, Some(RiskLevel::Medium));
        assert_eq!(event.organization_id.as_deref(), Some("org-1"));
        let resource = event.resource.as_ref().unwrap();
        assert_eq!(resource.resource_id, "p-42");
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_record_login_attempt() {
        let (_, _, recorder) = memory_recorder();

        let ok = recorder
            .record_login_attempt(true, "doc@clinic.test", None, None, None)
            .await;
        assert_eq!(ok.event_type, SecurityEventType::LoginSuccess);
        assert_eq!(ok.risk_level, Some(RiskLevel::Low));
        assert_eq!(ok.actor_email(), Some("doc@clinic.test"));
        assert!(ok.details.is_empty());

        let failed = recorder
            .record_login_attempt(
                false,
                "doc@clinic.test",
                None,
                Some(Origin::ip("198.51.100.4")),
                Some("invalid_password"),
            )
            .await;
        assert_eq!(failed.event_type, SecurityEventType::LoginFailure);
        assert_eq!(failed.risk_level, Some(RiskLevel::Medium));
        assert_eq!(failed.details["failureReason"], "invalid_password");
    }

    #[tokio::test]
    async fn test_record_security_event_risk() {
        let (_, sink, recorder) = memory_recorder();

        let breach = recorder
            .record_security_event(IncidentKind::BreachSuspected, BTreeMap::new(), None, None)
            .await;
        assert_eq!(breach.risk_level, Some(RiskLevel::Critical));

        for kind in [
            IncidentKind::UnauthorizedAccess,
            IncidentKind::SuspiciousActivity,
            IncidentKind::RateLimitExceeded,
        ] {
            let event = recorder
                .record_security_event(kind, BTreeMap::new(), None, None)
                .await;
            assert_eq!(event.risk_level, Some(RiskLevel::High));
            assert_eq!(event.event_type, kind.event_type());
        }

        assert_eq!(sink.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_append_order_matches_call_order() {
        let store = MemoryAuditStore::new();
        let recorder = Arc::new(AuditRecorder::new(
            Arc::new(store.clone()),
            AuditConfig::default(),
        ));

        let mut handles = Vec::new();
        for _ in 0..50 {
            let recorder = recorder.clone();
            handles.push(tokio::spawn(async move {
                recorder
                    .record(SecurityEvent::new(SecurityEventType::SessionStart))
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let stored = store.events().await;
        assert_eq!(stored.len(), 50);
        assert!(stored
            .windows(2)
            .all(|w| w[0].timestamp.unwrap() < w[1].timestamp.unwrap()));
    }

    #[tokio::test]
    async fn test_phi_details_encrypted_in_store_only() {
        let store = MemoryAuditStore::new();
        let sink = Arc::new(RecordingSink::default());
        let encryptor = Arc::new(Aes256GcmEncryptor::new("key-1", &[0x11; 32]));
        let recorder = AuditRecorder::new(Arc::new(store.clone()), AuditConfig::default())
            .with_escalation(sink.clone())
            .with_encryptor(encryptor.clone());

        let event = recorder
            .record(
                SecurityEvent::new(SecurityEventType::phi("patient", PhiAction::Delete))
                    .with_detail("reason", "duplicate chart")
                    .with_phi_accessed(true)
                    .with_risk_level(RiskLevel::Critical),
            )
            .await;
        assert_eq!(event.details["reason"], "duplicate chart");

        let stored = store.events().await;
        assert!(EncryptedDetails::is_encrypted(&stored[0].details));
        assert!(!stored[0].details.contains_key("reason"));
        assert_eq!(encryptor.open_event(&stored[0]).unwrap().details, event.details);

        assert_eq!(sink.submitted()[0].details["reason"], "duplicate chart");
        assert_eq!(recorder.metrics().snapshot().encrypted, 1);

        // Non-PHI events pass through untouched
        recorder
            .record(SecurityEvent::new(SecurityEventType::Logout).with_detail("why", "idle"))
            .await;
        assert_eq!(store.events().await[1].details["why"], "idle");
    }

    #[test]
    fn test_metrics_snapshot_serialization() {
        let metrics = RecorderMetrics::default();
        metrics.append_failures.fetch_add(2, Ordering::Relaxed);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["appendFailures"], 2);
        assert_eq!(json["recorded"], 0);
    }
}
