//! # clinic-sentinel
//!
//! Security observability pipeline for clinical records systems.
//!
//! ## Overview
//!
//! `clinic-sentinel` classifies sensitive operations into audit events with a
//! risk level, scans inbound request material for known attack patterns, and
//! escalates high-risk events to notification channels. Audit and alerting
//! failures are logged and counted, never returned to the operation being
//! observed.
//!
//! ## Quick Start
//!
//! ```rust
//! use clinic_sentinel::{
//!     Actor, ChannelKind, IntrusionPipeline, MemoryChannel, Origin, PhiAction, ScanRequest,
//!     SentinelConfig,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> clinic_sentinel::Result<()> {
//! let mut config = SentinelConfig::default();
//! config.alerting.webhook_url = Some("https://hooks.example/secops".to_string());
//!
//! let pipeline = IntrusionPipeline::builder(config)
//!     .channel(Arc::new(MemoryChannel::new(ChannelKind::Webhook)))
//!     .build()
//!     .await?;
//!
//! // Scan the request before handling it
//! let verdict = pipeline
//!     .scan(&ScanRequest::new().with_url("/patients?id=1' OR '1'='1"))
//!     .await;
//! assert!(verdict.blocked);
//!
//! // Audit the business operation itself
//! pipeline
//!     .record_phi_access(
//!         Some(Actor::user("u-17").with_email("doc@clinic.example")),
//!         Some("org-3"),
//!         "patient",
//!         "p-42",
//!         PhiAction::View,
//!         Some(Origin::ip("10.0.4.2")),
//!     )
//!     .await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Stores
//!
//! - **memory**: in-process store for testing and single-process use
//! - **nats**: NATS JetStream stream with delete and purge denied
//!
//! ## Architecture
//!
//! - **taxonomy**: event type to risk level, event type to alert title
//! - **AuditRecorder**: stamps, classifies and appends events; hands CRITICAL ones to escalation
//! - **ThreatDetector**: per-category signatures plus after-hours, input-limit and rate rules
//! - **AlertEscalator**: bounded alert buffer and severity-gated channel fan-out
//! - **IntrusionPipeline**: composes the above for one inbound operation

pub mod config;
pub mod crypto;
pub mod detector;
pub mod error;
pub mod escalator;
pub mod pipeline;
pub mod rate;
pub mod recorder;
pub mod store;
pub mod taxonomy;
pub mod types;

// Re-export core types
pub use config::{AlertingConfig, AuditConfig, DetectorConfig, SentinelConfig};
pub use crypto::{Aes256GcmEncryptor, DetailsEncryptor, EncryptedDetails};
pub use detector::{should_block, ScanRequest, SignatureSet, ThreatDetector};
pub use error::{Result, SentinelError};
pub use escalator::{
    AlertBuffer, AlertEscalator, EscalationHandle, EscalationSink, EscalatorStats, MemoryChannel,
    NotificationChannel, WebhookMessage,
};
pub use pipeline::{IntrusionPipeline, PipelineBuilder, ScanVerdict};
pub use recorder::{AuditRecorder, IncidentKind, RecorderMetrics, RecorderMetricsSnapshot};
pub use store::{AuditStore, StoreInfo};
pub use taxonomy::classify;
pub use types::{
    Actor, Alert, ChannelKind, Origin, PhiAction, ResourceRef, RiskLevel, SecurityEvent,
    SecurityEventType, ThreatDetection, ThreatType,
};

// Re-export stores for convenience
pub use store::memory::MemoryAuditStore;
pub use store::nats::{NatsAuditConfig, NatsAuditStore, NatsClient, StorageType};
