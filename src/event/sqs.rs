//! SQS-backed event bus driver.
//!
//! Requires a FIFO queue: the envelope's ordering key becomes the message
//! group id, which is what delivers all events for one application to a
//! single consumer at a time. Acks delete the message; nacks reset its
//! visibility so it is redelivered immediately.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::types::QueueAttributeName;
use uuid::Uuid;

use crate::operation::Checker;

use super::{Message, Subscription, Topic};

/// Long-poll wait per receive call, in seconds.
const RECEIVE_WAIT_SECONDS: i32 = 20;

fn queue_url(rest: &str) -> String {
    format!("https://{rest}")
}

async fn client() -> aws_sdk_sqs::Client {
    let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
    aws_sdk_sqs::Client::new(&config)
}

async fn check_queue(client: &aws_sdk_sqs::Client, queue_url: &str) -> Result<()> {
    client
        .get_queue_attributes()
        .queue_url(queue_url)
        .attribute_names(QueueAttributeName::QueueArn)
        .send()
        .await
        .with_context(|| format!("checking queue {queue_url}"))?;

    Ok(())
}

/// The write half of an SQS-backed bus.
pub struct SqsTopic {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsTopic {
    /// Open a topic over the queue at `sqs://<queue-url-without-scheme>`.
    pub async fn open(rest: &str) -> Result<Self> {
        let this = Self {
            client: client().await,
            queue_url: queue_url(rest),
        };

        check_queue(&this.client, &this.queue_url).await?;
        Ok(this)
    }
}

#[async_trait]
impl Checker for SqsTopic {
    fn name(&self) -> String {
        format!("sqs://{}", self.queue_url.trim_start_matches("https://"))
    }

    async fn check(&self) -> Result<()> {
        check_queue(&self.client, &self.queue_url).await
    }
}

#[async_trait]
impl Topic for SqsTopic {
    async fn send(&self, body: Vec<u8>, key: &str) -> Result<()> {
        let body = String::from_utf8(body).context("event body is not valid utf-8")?;

        let mut request = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .message_deduplication_id(Uuid::new_v4().to_string());

        if !key.is_empty() {
            request = request.message_group_id(key);
        }

        request.send().await.context("sending message")?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// The read half of an SQS-backed bus.
pub struct SqsSubscription {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsSubscription {
    /// Open a subscription over the queue at `sqs://<queue-url>`.
    pub async fn open(rest: &str) -> Result<Self> {
        let this = Self {
            client: client().await,
            queue_url: queue_url(rest),
        };

        check_queue(&this.client, &this.queue_url).await?;
        Ok(this)
    }
}

#[async_trait]
impl Checker for SqsSubscription {
    fn name(&self) -> String {
        format!("sqs://{}", self.queue_url.trim_start_matches("https://"))
    }

    async fn check(&self) -> Result<()> {
        check_queue(&self.client, &self.queue_url).await
    }
}

#[async_trait]
impl Subscription for SqsSubscription {
    async fn receive(&self) -> Result<Box<dyn Message>> {
        loop {
            let output = self
                .client
                .receive_message()
                .queue_url(&self.queue_url)
                .max_number_of_messages(1)
                .wait_time_seconds(RECEIVE_WAIT_SECONDS)
                .send()
                .await
                .context("receiving message")?;

            let Some(message) = output.messages.unwrap_or_default().into_iter().next() else {
                continue;
            };

            let receipt_handle = message
                .receipt_handle
                .ok_or_else(|| anyhow!("message has no receipt handle"))?;

            return Ok(Box::new(SqsMessage {
                body: message.body.unwrap_or_default().into_bytes(),
                receipt_handle,
                client: self.client.clone(),
                queue_url: self.queue_url.clone(),
            }));
        }
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

struct SqsMessage {
    body: Vec<u8>,
    receipt_handle: String,
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

#[async_trait]
impl Message for SqsMessage {
    fn body(&self) -> &[u8] {
        &self.body
    }

    async fn ack(self: Box<Self>) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .send()
            .await
            .context("deleting message")?;

        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(&self.receipt_handle)
            .visibility_timeout(0)
            .send()
            .await
            .context("resetting message visibility")?;

        Ok(())
    }
}
