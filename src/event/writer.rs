//! The write half of the event bus.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::operation::Checker;

use super::{wrap, Payload, Topic, CLOSE_TIMEOUT};

/// Publishes messages onto an event bus.
pub struct Writer {
    topic: Arc<dyn Topic>,
}

impl Writer {
    pub fn new(topic: Arc<dyn Topic>) -> Self {
        Self { topic }
    }

    /// Open a writer for the bus described by a provider URL.
    pub async fn open(url: &str) -> Result<Self> {
        Ok(Self::new(super::open_topic(url).await?))
    }

    /// Write an event onto the bus. The payload is wrapped in an envelope
    /// before publishing; its key populates the backend's partition key
    /// where supported. Failures are returned to the caller without retry.
    pub async fn write<P: Payload + Sync>(&self, payload: &P) -> Result<()> {
        let envelope = wrap(payload).context("wrapping event")?;
        let body = serde_json::to_vec(&envelope).context("encoding envelope")?;

        debug!(
            id = %envelope.id,
            event_type = %envelope.event_type,
            timestamp = %envelope.timestamp,
            "publishing event",
        );

        self.topic.send(body, &payload.key()).await
    }

    /// Close the connection to the bus, allowing [`CLOSE_TIMEOUT`] for any
    /// buffered sends to drain.
    pub async fn close(&self) -> Result<()> {
        tokio::time::timeout(CLOSE_TIMEOUT, self.topic.shutdown())
            .await
            .context("event writer close timed out")?
    }
}

#[async_trait]
impl Checker for Writer {
    fn name(&self) -> String {
        self.topic.name()
    }

    async fn check(&self) -> Result<()> {
        self.topic.check().await
    }
}
