//! In-memory audit store for development and testing

use super::{AuditStore, StoreInfo};
use crate::error::Result;
use crate::types::SecurityEvent;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory append-only audit store
///
/// Keeps every appended event in insertion order. Events are lost on drop.
#[derive(Clone, Default)]
pub struct MemoryAuditStore {
    events: Arc<RwLock<Vec<SecurityEvent>>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events in append order (oldest first)
    pub async fn events(&self) -> Vec<SecurityEvent> {
        self.events.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, event: &SecurityEvent) -> Result<u64> {
        let mut events = self.events.write().await;
        events.push(event.clone());
        let sequence = events.len() as u64;

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            sequence,
            "Event appended to memory store"
        );

        Ok(sequence)
    }

    async fn history(&self, limit: usize) -> Result<Vec<SecurityEvent>> {
        let events = self.events.read().await;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }

    async fn info(&self) -> Result<StoreInfo> {
        let events = self.events.read().await;
        Ok(StoreInfo {
            store: "memory".to_string(),
            events: events.len() as u64,
            bytes: 0,
            last_sequence: events.len() as u64,
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}
