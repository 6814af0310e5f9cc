//! Audit store trait: the append-only sink for security events
//!
//! The store is an external collaborator: the pipeline only appends to it
//! and never updates or deletes. Backends (JetStream, in-memory, a hosted
//! database client) implement `AuditStore`.

use crate::error::Result;
use crate::types::SecurityEvent;
use async_trait::async_trait;

pub mod memory;
pub mod nats;

/// Core trait for audit log backends
///
/// `append` may fail; the `AuditRecorder` swallows those failures so an
/// outage of the log store never becomes an outage of the clinical
/// application.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append an event, returning the store-assigned sequence number
    async fn append(&self, event: &SecurityEvent) -> Result<u64>;

    /// Most recent events, newest first
    ///
    /// Exposed for reporting consumers and tests; the pipeline itself
    /// never reads back.
    async fn history(&self, limit: usize) -> Result<Vec<SecurityEvent>>;

    /// Store status information
    async fn info(&self) -> Result<StoreInfo>;

    /// Store name (e.g., "nats", "memory")
    fn name(&self) -> &str;

    /// Health check, true if the store is reachable
    ///
    /// Default implementation delegates to `info()` and returns true if it succeeds.
    async fn health(&self) -> Result<bool> {
        self.info().await.map(|_| true)
    }
}

/// Store status information
#[derive(Debug, Clone)]
pub struct StoreInfo {
    /// Store name
    pub store: String,
    /// Total events stored
    pub events: u64,
    /// Total bytes used, when the backend reports it
    pub bytes: u64,
    /// Sequence number of the last appended event
    pub last_sequence: u64,
}
