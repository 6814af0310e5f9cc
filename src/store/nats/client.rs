//! NATS JetStream client: connect, append, read back

use super::config::{NatsAuditConfig, StorageType};
use crate::error::{Result, SentinelError};
use crate::types::SecurityEvent;
use async_nats::jetstream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// NATS JetStream client
///
/// Manages the connection and the audit stream lifecycle.
pub struct NatsClient {
    /// NATS client connection
    client: async_nats::Client,

    /// JetStream context
    jetstream: jetstream::Context,

    /// JetStream stream handle (Mutex for methods requiring &mut self)
    stream: Mutex<jetstream::stream::Stream>,

    config: Arc<NatsAuditConfig>,
}

impl NatsClient {
    /// Connect to NATS and initialize the audit stream
    pub async fn connect(config: NatsAuditConfig) -> Result<Self> {
        let connect_opts = build_connect_options(&config);

        let client = connect_opts
            .connect(&config.url)
            .await
            .map_err(|e| SentinelError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        let stream = ensure_stream(&jetstream, &config).await?;

        Ok(Self {
            client,
            jetstream,
            stream: Mutex::new(stream),
            config: Arc::new(config),
        })
    }

    /// Publish an event and wait for the stream ack
    pub async fn append(&self, event: &SecurityEvent) -> Result<u64> {
        let subject = self.config.event_subject(&event.event_type.to_string());
        let payload = serde_json::to_vec(event)?;

        let ack = self
            .jetstream
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| SentinelError::Append {
                store: "nats".to_string(),
                reason: format!("{}: {}", subject, e),
            })?
            .await
            .map_err(|e| SentinelError::Append {
                store: "nats".to_string(),
                reason: format!("ack failed on {}: {}", subject, e),
            })?;

        tracing::debug!(
            event_id = %event.id,
            subject = %subject,
            sequence = ack.sequence,
            "Audit event appended"
        );

        Ok(ack.sequence)
    }

    /// Fetch the most recent events, newest first
    pub async fn history(&self, limit: usize) -> Result<Vec<SecurityEvent>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let last_sequence = self.stream_info().await?.last_sequence;
        if last_sequence == 0 {
            return Ok(Vec::new());
        }
        let start_sequence = last_sequence.saturating_sub(limit as u64 - 1).max(1);

        let config = jetstream::consumer::pull::Config {
            deliver_policy: jetstream::consumer::DeliverPolicy::ByStartSequence {
                start_sequence,
            },
            ack_policy: jetstream::consumer::AckPolicy::None,
            ..Default::default()
        };

        let consumer = self
            .stream
            .lock()
            .await
            .create_consumer(config)
            .await
            .map_err(|e| SentinelError::Stream(format!("Failed to create history consumer: {}", e)))?;

        let batch = consumer
            .fetch()
            .max_messages(limit)
            .expires(Duration::from_secs(self.config.request_timeout_secs))
            .messages()
            .await
            .map_err(|e| SentinelError::Stream(format!("Failed to fetch history: {}", e)))?;

        let mut events = Vec::with_capacity(limit);
        let mut batch = std::pin::pin!(batch);
        while let Some(msg) = batch.next().await {
            match msg {
                Ok(msg) => {
                    if let Ok(event) = serde_json::from_slice::<SecurityEvent>(&msg.payload) {
                        events.push(event);
                    }
                    if events.len() >= limit {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("Error fetching history message: {}", e);
                    break;
                }
            }
        }

        events.reverse();
        Ok(events)
    }

    /// Get stream info
    pub async fn stream_info(&self) -> Result<StreamInfo> {
        let mut stream = self.stream.lock().await;
        let info = stream
            .info()
            .await
            .map_err(|e| SentinelError::Stream(format!("Failed to get stream info: {}", e)))?;

        Ok(StreamInfo {
            messages: info.state.messages,
            bytes: info.state.bytes,
            last_sequence: info.state.last_sequence,
        })
    }

    /// Get the underlying NATS client
    pub fn nats_client(&self) -> &async_nats::Client {
        &self.client
    }

    pub fn config(&self) -> &NatsAuditConfig {
        &self.config
    }
}

/// Summary of stream state
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub messages: u64,
    pub bytes: u64,
    pub last_sequence: u64,
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsAuditConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

/// Ensure the audit stream exists with the configured limits
async fn ensure_stream(
    js: &jetstream::Context,
    config: &NatsAuditConfig,
) -> Result<jetstream::stream::Stream> {
    let storage = match config.storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    };

    let max_age = if config.max_age_secs > 0 {
        Duration::from_secs(config.max_age_secs)
    } else {
        Duration::ZERO
    };

    let stream_config = jetstream::stream::Config {
        name: config.stream_name.clone(),
        subjects: config.stream_subjects(),
        storage,
        max_messages: config.max_events,
        max_age,
        max_bytes: config.max_bytes,
        retention: jetstream::stream::RetentionPolicy::Limits,
        deny_delete: true,
        deny_purge: true,
        ..Default::default()
    };

    let stream = js
        .get_or_create_stream(stream_config)
        .await
        .map_err(|e| SentinelError::Stream(format!(
            "Failed to create/get stream '{}': {}",
            config.stream_name, e
        )))?;

    tracing::info!(
        stream = %config.stream_name,
        subjects = ?config.stream_subjects(),
        "Audit stream ready"
    );

    Ok(stream)
}
