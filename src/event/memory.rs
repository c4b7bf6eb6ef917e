//! In-process event bus used by tests and local development.
//!
//! A topic is a single FIFO queue, so per-key ordering holds trivially.
//! Nacked messages are redelivered at the front of the queue. Messages
//! popped by a consumer that dies before acking are lost, which is fine for
//! the in-process use case.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::operation::Checker;

use super::{Message, Subscription, Topic};

static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<MemoryTopic>>>> = OnceLock::new();

/// Topics opened through `mem://<name>` URLs are shared per process so that
/// components wired together in one binary observe the same messages.
pub(super) fn shared(name: &str) -> Arc<MemoryTopic> {
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    Arc::clone(
        registry
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryTopic::new(name))),
    )
}

/// An in-process topic backed by a FIFO queue.
pub struct MemoryTopic {
    name: String,
    queue: Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl MemoryTopic {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push_front(&self, body: Vec<u8>) {
        self.queue.lock().push_front(body);
        self.notify.notify_one();
    }
}

#[async_trait]
impl Checker for MemoryTopic {
    fn name(&self) -> String {
        format!("mem://{}", self.name)
    }

    async fn check(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Topic for MemoryTopic {
    async fn send(&self, body: Vec<u8>, _key: &str) -> Result<()> {
        self.queue.lock().push_back(body);
        self.notify.notify_one();
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// A subscription over an in-process topic.
pub struct MemorySubscription {
    topic: Arc<MemoryTopic>,
}

impl MemorySubscription {
    pub fn new(topic: Arc<MemoryTopic>) -> Self {
        Self { topic }
    }
}

#[async_trait]
impl Checker for MemorySubscription {
    fn name(&self) -> String {
        self.topic.name()
    }

    async fn check(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn receive(&self) -> Result<Box<dyn Message>> {
        loop {
            if let Some(body) = self.topic.queue.lock().pop_front() {
                return Ok(Box::new(MemoryMessage {
                    body,
                    topic: Arc::clone(&self.topic),
                }));
            }

            self.topic.notify.notified().await;
        }
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryMessage {
    body: Vec<u8>,
    topic: Arc<MemoryTopic>,
}

#[async_trait]
impl Message for MemoryMessage {
    fn body(&self) -> &[u8] {
        &self.body
    }

    async fn ack(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn nack(self: Box<Self>) -> Result<()> {
        self.topic.push_front(self.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_delivery() {
        let topic = Arc::new(MemoryTopic::new("fifo"));
        let subscription = MemorySubscription::new(Arc::clone(&topic));

        topic.send(b"first".to_vec(), "k").await.expect("send");
        topic.send(b"second".to_vec(), "k").await.expect("send");

        let message = subscription.receive().await.expect("receive");
        assert_eq!(message.body(), b"first");
        message.ack().await.expect("ack");

        let message = subscription.receive().await.expect("receive");
        assert_eq!(message.body(), b"second");
        message.ack().await.expect("ack");
    }

    #[tokio::test]
    async fn test_nack_redelivers_first() {
        let topic = Arc::new(MemoryTopic::new("nack"));
        let subscription = MemorySubscription::new(Arc::clone(&topic));

        topic.send(b"first".to_vec(), "k").await.expect("send");
        topic.send(b"second".to_vec(), "k").await.expect("send");

        let message = subscription.receive().await.expect("receive");
        message.nack().await.expect("nack");

        let message = subscription.receive().await.expect("receive");
        assert_eq!(message.body(), b"first");
    }

    #[tokio::test]
    async fn test_receive_wakes_on_send() {
        let topic = Arc::new(MemoryTopic::new("wake"));
        let subscription = MemorySubscription::new(Arc::clone(&topic));

        let sender = Arc::clone(&topic);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            sender.send(b"late".to_vec(), "k").await.expect("send");
        });

        let message = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            subscription.receive(),
        )
        .await
        .expect("should not time out")
        .expect("receive");

        assert_eq!(message.body(), b"late");
    }

    #[tokio::test]
    async fn test_shared_registry_returns_same_topic() {
        let a = shared("registry-test");
        let b = shared("registry-test");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
