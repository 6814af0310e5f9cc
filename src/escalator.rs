//! Alert escalation: qualifying events become alerts fanned out to channels
//!
//! Alerts are kept in a bounded, most-recent-first buffer owned by the
//! escalator. Channel sends for one alert run concurrently; a failing channel
//! never stops the others and never surfaces to the caller of `escalate`.
//!
//! Recorders do not await escalation. They hand events to an
//! `EscalationSink`, normally an `EscalationHandle` whose dispatch worker
//! spawns one task per alert.

use crate::config::AlertingConfig;
use crate::error::{Result, SentinelError};
use crate::taxonomy;
use crate::types::{next_timestamp, Alert, ChannelKind, RiskLevel, SecurityEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

/// Bounded ring buffer of recent alerts, newest first
///
/// Insertion at the head and eviction at the tail happen under one write
/// lock; channel dispatch never holds it.
pub struct AlertBuffer {
    alerts: RwLock<VecDeque<Alert>>,
    capacity: usize,
}

impl AlertBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            alerts: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert at the head; returns the evicted tail alert, if any
    pub async fn push(&self, alert: Alert) -> Option<Alert> {
        let mut alerts = self.alerts.write().await;
        alerts.push_front(alert);
        if alerts.len() > self.capacity {
            alerts.pop_back()
        } else {
            None
        }
    }

    /// Flip `notified` on a buffered alert; false if it was already evicted
    pub async fn mark_notified(&self, alert_id: &str) -> bool {
        let mut alerts = self.alerts.write().await;
        match alerts.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) => {
                alert.notified = true;
                true
            }
            None => false,
        }
    }

    pub async fn recent(&self, limit: usize) -> Vec<Alert> {
        let alerts = self.alerts.read().await;
        alerts.iter().take(limit).cloned().collect()
    }

    pub async fn by_severity(&self, severity: RiskLevel, limit: usize) -> Vec<Alert> {
        let alerts = self.alerts.read().await;
        alerts
            .iter()
            .filter(|a| a.severity == severity)
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.alerts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.alerts.read().await.is_empty()
    }
}

/// A notification transport
///
/// Implementations own the delivery mechanics (SMTP relay, SMS gateway,
/// chat webhook). The destination comes from `AlertingConfig`.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Deliver one alert to `destination`
    async fn send(&self, alert: &Alert, destination: &str) -> Result<()>;

    /// Channel name for diagnostics
    fn name(&self) -> &str {
        self.kind().as_str()
    }
}

/// Structured webhook payload
///
/// Fields are kept discrete; formatting is the receiving side's concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookMessage {
    pub alert_id: String,
    pub title: String,
    pub description: String,
    pub severity: RiskLevel,
    pub timestamp: u64,
    pub event_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_email: Option<String>,
}

impl WebhookMessage {
    pub fn from_alert(alert: &Alert) -> Self {
        Self {
            alert_id: alert.id.clone(),
            title: alert.title.clone(),
            description: alert.description.clone(),
            severity: alert.severity,
            timestamp: alert.timestamp,
            event_type: alert.source_event.event_type.to_string(),
            actor_email: alert.source_event.actor_email().map(str::to_string),
        }
    }
}

/// A delivery captured by `MemoryChannel`
#[derive(Debug, Clone)]
pub struct Delivery {
    pub destination: String,
    pub alert: Alert,
}

/// In-process channel that records deliveries, for development and testing
#[derive(Clone)]
pub struct MemoryChannel {
    kind: ChannelKind,
    deliveries: Arc<RwLock<Vec<Delivery>>>,
}

impl MemoryChannel {
    pub fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            deliveries: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Deliveries in send order
    pub async fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.read().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.deliveries.read().await.len()
    }
}

#[async_trait]
impl NotificationChannel for MemoryChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn send(&self, alert: &Alert, destination: &str) -> Result<()> {
        self.deliveries.write().await.push(Delivery {
            destination: destination.to_string(),
            alert: alert.clone(),
        });
        Ok(())
    }
}

/// Point-in-time escalator counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalatorStats {
    pub alerts_raised: u64,
    pub dispatch_failures: u64,
    pub buffered: usize,
}

struct EscalatorInner {
    buffer: AlertBuffer,
    channels: Vec<Arc<dyn NotificationChannel>>,
    config: AlertingConfig,
    alerts_raised: AtomicU64,
    dispatch_failures: AtomicU64,
}

/// Builds alerts from events and fans them out to channels
///
/// Cheap to clone; clones share the buffer, channels and counters.
#[derive(Clone)]
pub struct AlertEscalator {
    inner: Arc<EscalatorInner>,
}

impl AlertEscalator {
    pub fn new(config: AlertingConfig, channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self {
            inner: Arc::new(EscalatorInner {
                buffer: AlertBuffer::new(config.buffer_capacity),
                channels,
                config,
                alerts_raised: AtomicU64::new(0),
                dispatch_failures: AtomicU64::new(0),
            }),
        }
    }

    pub fn buffer(&self) -> &AlertBuffer {
        &self.inner.buffer
    }

    pub fn config(&self) -> &AlertingConfig {
        &self.inner.config
    }

    /// Build an alert, buffer it, and dispatch it to every qualifying channel
    ///
    /// Returns once every selected channel attempt has settled, with
    /// `notified` set.
    pub async fn escalate(&self, event: SecurityEvent) -> Alert {
        let mut alert = build_alert(event);
        self.inner.alerts_raised.fetch_add(1, Ordering::Relaxed);

        if let Some(evicted) = self.inner.buffer.push(alert.clone()).await {
            tracing::debug!(alert_id = %evicted.id, "Alert evicted from buffer");
        }

        let selected: Vec<(&Arc<dyn NotificationChannel>, &str)> = self
            .inner
            .channels
            .iter()
            .filter(|ch| channel_qualifies(ch.kind(), alert.severity))
            .filter_map(|ch| {
                self.inner
                    .config
                    .destination(ch.kind())
                    .map(|dest| (ch, dest))
            })
            .collect();

        tracing::info!(
            alert_id = %alert.id,
            event_id = %alert.source_event.id,
            severity = %alert.severity,
            channels = selected.len(),
            "Escalating alert"
        );

        let pending = &alert;
        let sends = selected.iter().map(|(ch, dest)| async move {
            (ch.name().to_string(), ch.send(pending, dest).await)
        });
        let outcomes = futures::future::join_all(sends).await;

        for (channel, outcome) in outcomes {
            if let Err(e) = outcome {
                self.inner.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    alert_id = %alert.id,
                    channel = %channel,
                    error = %e,
                    "Alert channel dispatch failed"
                );
            }
        }

        self.inner.buffer.mark_notified(&alert.id).await;
        alert.notified = true;
        alert
    }

    pub async fn recent(&self, limit: usize) -> Vec<Alert> {
        self.inner.buffer.recent(limit).await
    }

    pub async fn by_severity(&self, severity: RiskLevel, limit: usize) -> Vec<Alert> {
        self.inner.buffer.by_severity(severity, limit).await
    }

    /// Every CRITICAL alert still inside the buffer window
    pub async fn critical_unresolved(&self) -> Vec<Alert> {
        self.inner
            .buffer
            .by_severity(RiskLevel::Critical, usize::MAX)
            .await
    }

    pub fn dispatch_failures(&self) -> u64 {
        self.inner.dispatch_failures.load(Ordering::Relaxed)
    }

    pub async fn stats(&self) -> EscalatorStats {
        EscalatorStats {
            alerts_raised: self.inner.alerts_raised.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures(),
            buffered: self.inner.buffer.len().await,
        }
    }

    /// Start a dispatch worker and return a sink feeding it
    ///
    /// Must be called from within a Tokio runtime. The worker stops once
    /// every handle is dropped.
    pub fn start_dispatcher(&self) -> EscalationHandle {
        let (tx, mut rx) = mpsc::unbounded_channel::<SecurityEvent>();
        let escalator = self.clone();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let escalator = escalator.clone();
                tokio::spawn(async move {
                    escalator.escalate(event).await;
                });
            }
            tracing::debug!("Escalation dispatcher stopped");
        });

        EscalationHandle { tx }
    }
}

/// Receiver of events that must be escalated without blocking the caller
pub trait EscalationSink: Send + Sync {
    fn submit(&self, event: SecurityEvent) -> Result<()>;
}

/// Sender side of an escalation dispatch worker
#[derive(Clone)]
pub struct EscalationHandle {
    tx: mpsc::UnboundedSender<SecurityEvent>,
}

impl EscalationHandle {
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl EscalationSink for EscalationHandle {
    fn submit(&self, event: SecurityEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| SentinelError::DispatcherClosed)
    }
}

/// Webhook for every alert, email from HIGH, SMS only for CRITICAL
fn channel_qualifies(kind: ChannelKind, severity: RiskLevel) -> bool {
    match kind {
        ChannelKind::Webhook => true,
        ChannelKind::Email => severity >= RiskLevel::High,
        ChannelKind::Sms => severity == RiskLevel::Critical,
    }
}

fn build_alert(event: SecurityEvent) -> Alert {
    Alert {
        id: format!("alt-{}", uuid::Uuid::new_v4()),
        timestamp: next_timestamp(),
        severity: event.risk(),
        title: taxonomy::alert_title(&event.event_type),
        description: describe(&event),
        source_event: event,
        notified: false,
    }
}

fn describe(event: &SecurityEvent) -> String {
    let mut lines = vec![format!("Event: {}", event.event_type)];
    if let Some(email) = event.actor_email() {
        lines.push(format!("User: {}", email));
    }
    if let Some(ip) = event.origin_ip() {
        lines.push(format!("IP Address: {}", ip));
    }
    if let Some(resource) = &event.resource {
        lines.push(format!(
            "Resource: {} {}",
            resource.resource_type, resource.resource_id
        ));
    }
    if !event.details.is_empty() {
        if let Ok(details) = serde_json::to_string(&event.details) {
            lines.push(format!("Details: {}", details));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Actor, Origin, SecurityEventType};
    use std::time::Duration;

    struct FailingChannel(ChannelKind);

    #[async_trait]
    impl NotificationChannel for FailingChannel {
        fn kind(&self) -> ChannelKind {
            self.0
        }

        async fn send(&self, _alert: &Alert, _destination: &str) -> Result<()> {
            Err(SentinelError::Channel {
                channel: self.0.to_string(),
                reason: "gateway unavailable".to_string(),
            })
        }
    }

    /// Holds every send until released
    struct GatedChannel {
        kind: ChannelKind,
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl NotificationChannel for GatedChannel {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        async fn send(&self, _alert: &Alert, _destination: &str) -> Result<()> {
            self.release.notified().await;
            Ok(())
        }
    }

    fn all_destinations() -> AlertingConfig {
        AlertingConfig {
            email_recipient: Some("secops@clinic.test".to_string()),
            sms_recipient: Some("+15550100".to_string()),
            webhook_url: Some("https://hooks.clinic.test/alerts".to_string()),
            ..Default::default()
        }
    }

    fn memory_channels() -> (MemoryChannel, MemoryChannel, MemoryChannel) {
        (
            MemoryChannel::new(ChannelKind::Webhook),
            MemoryChannel::new(ChannelKind::Email),
            MemoryChannel::new(ChannelKind::Sms),
        )
    }

    fn escalator_with(
        config: AlertingConfig,
        webhook: &MemoryChannel,
        email: &MemoryChannel,
        sms: &MemoryChannel,
    ) -> AlertEscalator {
        AlertEscalator::new(
            config,
            vec![
                Arc::new(webhook.clone()),
                Arc::new(email.clone()),
                Arc::new(sms.clone()),
            ],
        )
    }

    fn event_at(risk: RiskLevel) -> SecurityEvent {
        SecurityEvent::new(SecurityEventType::SuspiciousActivity).with_risk_level(risk)
    }

    #[tokio::test]
    async fn test_buffer_bounded_and_newest_first() {
        let buffer = AlertBuffer::new(1000);
        let mut ids = Vec::new();
        for _ in 0..1001 {
            let alert = build_alert(event_at(RiskLevel::Low));
            ids.push(alert.id.clone());
            buffer.push(alert).await;
        }

        assert_eq!(buffer.len().await, 1000);
        let all = buffer.recent(usize::MAX).await;
        assert_eq!(all.first().unwrap().id, ids[1000]);
        assert_eq!(all.last().unwrap().id, ids[1]);
        assert!(all.iter().all(|a| a.id != ids[0]));
    }

    #[tokio::test]
    async fn test_buffer_push_reports_eviction() {
        let buffer = AlertBuffer::new(2);
        assert!(buffer.push(build_alert(event_at(RiskLevel::Low))).await.is_none());
        let first_id = buffer.recent(1).await[0].id.clone();
        assert!(buffer.push(build_alert(event_at(RiskLevel::Low))).await.is_none());
        let evicted = buffer.push(build_alert(event_at(RiskLevel::Low))).await;
        assert_eq!(evicted.unwrap().id, first_id);
    }

    #[tokio::test]
    async fn test_severity_gating() {
        let (webhook, email, sms) = memory_channels();
        let escalator = escalator_with(all_destinations(), &webhook, &email, &sms);

        escalator.escalate(event_at(RiskLevel::Medium)).await;
        assert_eq!((webhook.count().await, email.count().await, sms.count().await), (1, 0, 0));

        escalator.escalate(event_at(RiskLevel::High)).await;
        assert_eq!((webhook.count().await, email.count().await, sms.count().await), (2, 1, 0));

        escalator.escalate(event_at(RiskLevel::Critical)).await;
        assert_eq!((webhook.count().await, email.count().await, sms.count().await), (3, 2, 1));

        let sms_deliveries = sms.deliveries().await;
        assert_eq!(sms_deliveries[0].destination, "+15550100");
    }

    #[tokio::test]
    async fn test_missing_destination_skips_channel() {
        let (webhook, email, sms) = memory_channels();
        let config = AlertingConfig {
            email_recipient: Some("secops@clinic.test".to_string()),
            ..Default::default()
        };
        let escalator = escalator_with(config, &webhook, &email, &sms);

        let alert = escalator.escalate(event_at(RiskLevel::Critical)).await;
        assert!(alert.notified);
        assert_eq!(webhook.count().await, 0);
        assert_eq!(email.count().await, 1);
        assert_eq!(sms.count().await, 0);
    }

    #[tokio::test]
    async fn test_all_channels_fail_still_notified() {
        let escalator = AlertEscalator::new(
            all_destinations(),
            vec![
                Arc::new(FailingChannel(ChannelKind::Webhook)),
                Arc::new(FailingChannel(ChannelKind::Email)),
                Arc::new(FailingChannel(ChannelKind::Sms)),
            ],
        );

        let alert = escalator.escalate(event_at(RiskLevel::Critical)).await;
        assert!(alert.notified);
        assert!(escalator.recent(1).await[0].notified);
        assert_eq!(escalator.dispatch_failures(), 3);
    }

    #[tokio::test]
    async fn test_notified_waits_for_slowest_channel() {
        let (webhook, email, _) = memory_channels();
        let release = Arc::new(tokio::sync::Notify::new());
        let escalator = AlertEscalator::new(
            all_destinations(),
            vec![
                Arc::new(webhook.clone()),
                Arc::new(email.clone()),
                Arc::new(GatedChannel {
                    kind: ChannelKind::Sms,
                    release: release.clone(),
                }),
            ],
        );

        let task = tokio::spawn({
            let escalator = escalator.clone();
            async move { escalator.escalate(event_at(RiskLevel::Critical)).await }
        });

        for _ in 0..100 {
            if webhook.count().await == 1 && email.count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(webhook.count().await, 1);
        assert_eq!(email.count().await, 1);

        let buffered = escalator.recent(1).await;
        assert_eq!(buffered.len(), 1);
        assert!(!buffered[0].notified);
        assert!(!task.is_finished());

        release.notify_one();
        let alert = task.await.unwrap();
        assert!(alert.notified);
        assert!(escalator.recent(1).await[0].notified);
    }

    #[tokio::test]
    async fn test_failing_channel_does_not_stop_others() {
        let email = MemoryChannel::new(ChannelKind::Email);
        let escalator = AlertEscalator::new(
            all_destinations(),
            vec![
                Arc::new(FailingChannel(ChannelKind::Webhook)),
                Arc::new(email.clone()),
            ],
        );

        escalator.escalate(event_at(RiskLevel::High)).await;
        assert_eq!(email.count().await, 1);
        assert_eq!(escalator.dispatch_failures(), 1);
    }

    #[tokio::test]
    async fn test_alert_title_and_description() {
        let escalator = AlertEscalator::new(AlertingConfig::default(), vec![]);
        let event = SecurityEvent::new(SecurityEventType::BreachSuspected)
            .with_actor(Actor::user("u-9").with_email("intruder@clinic.test"))
            .with_origin(Origin::ip("203.0.113.7"))
            .with_resource("patient", "p-42")
            .with_detail("rows", 5000);

        let alert = escalator.escalate(event).await;
        assert!(alert.id.starts_with("alt-"));
        assert_eq!(alert.severity, RiskLevel::Critical);
        assert_eq!(alert.title, "Potential Data Breach Detected");
        assert!(alert.description.contains("User: intruder@clinic.test"));
        assert!(alert.description.contains("IP Address: 203.0.113.7"));
        assert!(alert.description.contains("Resource: patient p-42"));
        assert!(alert.description.contains("\"rows\":5000"));
    }

    #[tokio::test]
    async fn test_description_omits_absent_fields() {
        let escalator = AlertEscalator::new(AlertingConfig::default(), vec![]);
        let alert = escalator
            .escalate(SecurityEvent::new(SecurityEventType::Other("CUSTOM_THING".into())))
            .await;

        assert_eq!(alert.title, "Security Event: CUSTOM_THING");
        assert_eq!(alert.description, "Event: CUSTOM_THING");
    }

    #[tokio::test]
    async fn test_repeated_triggers_are_not_deduplicated() {
        let escalator = AlertEscalator::new(AlertingConfig::default(), vec![]);
        let event = event_at(RiskLevel::High);
        escalator.escalate(event.clone()).await;
        escalator.escalate(event).await;
        assert_eq!(escalator.recent(10).await.len(), 2);
    }

    #[tokio::test]
    async fn test_queries() {
        let escalator = AlertEscalator::new(AlertingConfig::default(), vec![]);
        for risk in [RiskLevel::Critical, RiskLevel::High, RiskLevel::Critical, RiskLevel::Low] {
            escalator.escalate(event_at(risk)).await;
        }

        assert_eq!(escalator.recent(2).await.len(), 2);
        assert_eq!(escalator.recent(2).await[0].severity, RiskLevel::Low);
        assert_eq!(escalator.by_severity(RiskLevel::Critical, 1).await.len(), 1);
        assert_eq!(escalator.by_severity(RiskLevel::High, 10).await.len(), 1);
        assert_eq!(escalator.critical_unresolved().await.len(), 2);

        let stats = escalator.stats().await;
        assert_eq!(stats.alerts_raised, 4);
        assert_eq!(stats.buffered, 4);
    }

    #[tokio::test]
    async fn test_webhook_message_fields() {
        let escalator = AlertEscalator::new(AlertingConfig::default(), vec![]);
        let event = SecurityEvent::new(SecurityEventType::UnauthorizedAccess)
            .with_actor(Actor::user("u-1").with_email("doc@clinic.test"));
        let alert = escalator.escalate(event).await;

        let msg = WebhookMessage::from_alert(&alert);
        assert_eq!(msg.event_type, "UNAUTHORIZED_ACCESS");
        assert_eq!(msg.actor_email.as_deref(), Some("doc@clinic.test"));
        assert_eq!(msg.severity, RiskLevel::Critical);

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["eventType"], "UNAUTHORIZED_ACCESS");
        assert_eq!(json["actorEmail"], "doc@clinic.test");
        assert_eq!(json["title"], "Unauthorized Access Attempt");
    }

    #[tokio::test]
    async fn test_dispatcher_escalates_detached() {
        let webhook = MemoryChannel::new(ChannelKind::Webhook);
        let escalator = AlertEscalator::new(all_destinations(), vec![Arc::new(webhook.clone())]);
        let handle = escalator.start_dispatcher();

        handle.submit(event_at(RiskLevel::Critical)).unwrap();

        for _ in 0..100 {
            if webhook.count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(webhook.count().await, 1);
        assert_eq!(escalator.recent(10).await.len(), 1);
    }
}
