//! NATS JetStream audit store
//!
//! Implements `AuditStore` on a limits-retention JetStream stream with
//! delete and purge denied, giving a durable append-only audit log.

mod client;
mod config;

pub use client::{NatsClient, StreamInfo};
pub use config::{NatsAuditConfig, StorageType};

use crate::error::Result;
use crate::store::{AuditStore, StoreInfo};
use crate::types::SecurityEvent;
use async_trait::async_trait;

/// NATS JetStream audit store
///
/// Wraps `NatsClient` and implements the `AuditStore` trait.
pub struct NatsAuditStore {
    client: NatsClient,
}

impl NatsAuditStore {
    /// Connect to NATS and initialize the audit stream
    pub async fn connect(config: NatsAuditConfig) -> Result<Self> {
        let client = NatsClient::connect(config).await?;
        Ok(Self { client })
    }

    /// Get the underlying NATS client for advanced usage
    pub fn client(&self) -> &NatsClient {
        &self.client
    }
}

#[async_trait]
impl AuditStore for NatsAuditStore {
    async fn append(&self, event: &SecurityEvent) -> Result<u64> {
        self.client.append(event).await
    }

    async fn history(&self, limit: usize) -> Result<Vec<SecurityEvent>> {
        self.client.history(limit).await
    }

    async fn info(&self) -> Result<StoreInfo> {
        let info = self.client.stream_info().await?;
        Ok(StoreInfo {
            store: "nats".to_string(),
            events: info.messages,
            bytes: info.bytes,
            last_sequence: info.last_sequence,
        })
    }

    fn name(&self) -> &str {
        "nats"
    }
}
