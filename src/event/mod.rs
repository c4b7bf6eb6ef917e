//! Typed publish and ordered-per-key subscribe over an event bus.
//!
//! Payloads are wrapped in a JSON [`Envelope`] before hitting the wire.
//! Delivery is at least once; ordering is per key where the backend supports
//! it. The [`Writer`] and [`Reader`] types sit on top of narrow driver traits
//! so backends can be swapped without touching the core.

mod memory;
mod reader;
#[cfg(feature = "aws")]
mod sqs;
mod writer;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use memory::{MemorySubscription, MemoryTopic};
pub use reader::{EventHandler, Reader};
pub use writer::Writer;

use crate::blob::split_url;
use crate::operation::Checker;

/// How long writers and readers get to drain on close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// The structure of events published to and read from the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// A unique identifier for this publish attempt.
    pub id: Uuid,
    /// The time the event was published.
    pub timestamp: DateTime<Utc>,
    /// Denotes the structure of the payload field.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The JSON encoding of the event payload.
    pub payload: serde_json::Value,
}

/// Types that can be used as event payloads.
pub trait Payload: Serialize {
    /// A string unique to the event type.
    fn event_type(&self) -> &'static str;

    /// A string used to preserve ordering of events where the backend
    /// supports partitioning.
    fn key(&self) -> String;
}

pub(crate) fn wrap<P: Payload>(payload: &P) -> Result<Envelope> {
    Ok(Envelope {
        id: Uuid::new_v4(),
        timestamp: Utc::now(),
        event_type: payload.event_type().to_string(),
        payload: serde_json::to_value(payload).context("encoding payload")?,
    })
}

/// Unmarshal the envelope's payload into the type specified by the type
/// parameter.
pub fn unmarshal<T: DeserializeOwned>(envelope: &Envelope) -> Result<T> {
    serde_json::from_value(envelope.payload.clone()).context("decoding payload")
}

/// A message handed out by a subscription. Exactly one of [`Message::ack`]
/// or [`Message::nack`] must be called once handling completes.
#[async_trait]
pub trait Message: Send {
    fn body(&self) -> &[u8];

    /// Confirm successful handling, removing the message from the bus.
    async fn ack(self: Box<Self>) -> Result<()>;

    /// Request redelivery where the backend supports it.
    async fn nack(self: Box<Self>) -> Result<()>;
}

/// The write half of an event bus driver.
#[async_trait]
pub trait Topic: Checker {
    /// Send an opaque body, partitioned by the given key where supported.
    async fn send(&self, body: Vec<u8>, key: &str) -> Result<()>;

    /// Flush and release the connection to the bus.
    async fn shutdown(&self) -> Result<()>;
}

/// The read half of an event bus driver.
#[async_trait]
pub trait Subscription: Checker {
    /// Block until the next message is delivered.
    async fn receive(&self) -> Result<Box<dyn Message>>;

    /// Release the connection to the bus.
    async fn shutdown(&self) -> Result<()>;
}

/// Open the write half of the bus described by a provider URL.
///
/// Supported schemes: `mem://<topic>` (in-process, for tests and local
/// development) and, with the `aws` feature, `sqs://<queue-url>` pointing at
/// a FIFO queue.
pub async fn open_topic(url: &str) -> Result<Arc<dyn Topic>> {
    let (scheme, rest) = split_url(url)?;

    match scheme {
        "mem" => Ok(memory::shared(rest)),
        #[cfg(feature = "aws")]
        "sqs" => Ok(Arc::new(sqs::SqsTopic::open(rest).await?)),
        _ => bail!("unsupported event bus scheme {scheme:?} in {url:?}"),
    }
}

/// Open the read half of the bus described by a provider URL. See
/// [`open_topic`] for supported schemes.
pub async fn open_subscription(url: &str) -> Result<Arc<dyn Subscription>> {
    let (scheme, rest) = split_url(url)?;

    match scheme {
        "mem" => Ok(Arc::new(MemorySubscription::new(memory::shared(rest)))),
        #[cfg(feature = "aws")]
        "sqs" => Ok(Arc::new(sqs::SqsSubscription::open(rest).await?)),
        _ => bail!("unsupported event bus scheme {scheme:?} in {url:?}"),
    }
}
