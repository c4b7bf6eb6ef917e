//! The read half of the event bus.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::operation::Checker;

use super::{Envelope, Subscription, CLOSE_TIMEOUT};

/// Handles a single inbound event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Result<()>;
}

/// Consumes messages from an event bus.
///
/// The reader records the most recent receive error and reports it through
/// its health check.
pub struct Reader {
    subscription: Arc<dyn Subscription>,
    last_error: Mutex<Option<String>>,
}

impl Reader {
    pub fn new(subscription: Arc<dyn Subscription>) -> Self {
        Self {
            subscription,
            last_error: Mutex::new(None),
        }
    }

    /// Open a reader for the bus described by a provider URL.
    pub async fn open(url: &str) -> Result<Self> {
        Ok(Self::new(super::open_subscription(url).await?))
    }

    /// Read messages whose types appear in the filter set, invoking the
    /// handler for each. Messages outside the filter set are acknowledged
    /// and skipped. A handler error nacks the message where supported and
    /// exits the loop with that error; cancellation exits cleanly.
    pub async fn read(
        &self,
        cancel: &CancellationToken,
        types: &[&str],
        handler: &dyn EventHandler,
    ) -> Result<()> {
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                received = self.subscription.receive() => match received {
                    Ok(message) => {
                        *self.last_error.lock() = None;
                        message
                    }
                    Err(e) => {
                        *self.last_error.lock() = Some(e.to_string());
                        return Err(e.context("receiving event"));
                    }
                },
            };

            let envelope: Envelope = match serde_json::from_slice(message.body()) {
                Ok(envelope) => envelope,
                Err(e) => {
                    message.nack().await.ok();
                    return Err(anyhow!(e).context("could not unmarshal envelope"));
                }
            };

            if !types.contains(&envelope.event_type.as_str()) {
                debug!(
                    id = %envelope.id,
                    event_type = %envelope.event_type,
                    "ignoring event",
                );
                message.ack().await.context("acknowledging event")?;
                continue;
            }

            debug!(
                id = %envelope.id,
                event_type = %envelope.event_type,
                timestamp = %envelope.timestamp,
                "consumed event",
            );

            if let Err(e) = handler.handle(&envelope).await {
                message.nack().await.ok();
                return Err(e.context(format!("failed to handle event {}", envelope.id)));
            }

            message.ack().await.context("acknowledging event")?;
        }
    }

    /// Close the connection to the bus.
    pub async fn close(&self) -> Result<()> {
        tokio::time::timeout(CLOSE_TIMEOUT, self.subscription.shutdown())
            .await
            .context("event reader close timed out")?
    }
}

#[async_trait]
impl Checker for Reader {
    fn name(&self) -> String {
        self.subscription.name()
    }

    async fn check(&self) -> Result<()> {
        if let Some(message) = self.last_error.lock().clone() {
            anyhow::bail!("last receive failed: {message}");
        }

        self.subscription.check().await
    }
}
