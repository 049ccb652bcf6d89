//! Mock message bus implementation for testing.
//!
//! Records every publish and subscription. Nothing is routed between
//! publishers and subscribers; tests push messages into subscriptions by
//! hand with [`MockMessageBus::deliver`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};

use super::{BusError, MessageBus, Result, Subscription, Unsubscribe};

/// A message captured by `MockMessageBus`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub channel: String,
    pub payload: Bytes,
}

struct MockSubscriber {
    channel: String,
    sender: mpsc::Sender<Bytes>,
    closed: Arc<AtomicBool>,
}

struct MockUnsubscribe {
    closed: Arc<AtomicBool>,
}

impl Unsubscribe for MockUnsubscribe {
    fn unsubscribe(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Mock message bus for testing.
#[derive(Default)]
pub struct MockMessageBus {
    published: RwLock<Vec<PublishedMessage>>,
    subscribers: RwLock<Vec<MockSubscriber>>,
    fail_on_publish: RwLock<bool>,
    fail_on_subscribe: RwLock<bool>,
}

impl MockMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_publish(&self, fail: bool) {
        *self.fail_on_publish.write().await = fail;
    }

    pub async fn set_fail_on_subscribe(&self, fail: bool) {
        *self.fail_on_subscribe.write().await = fail;
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.read().await.clone()
    }

    pub async fn take_published(&self) -> Vec<PublishedMessage> {
        std::mem::take(&mut *self.published.write().await)
    }

    /// Channels subscribed so far, in order, including closed ones.
    pub async fn subscribed_channels(&self) -> Vec<String> {
        self.subscribers
            .read()
            .await
            .iter()
            .map(|s| s.channel.clone())
            .collect()
    }

    /// Number of subscriptions on `channel` that have not been closed.
    pub async fn open_subscriptions(&self, channel: &str) -> usize {
        self.subscribers
            .read()
            .await
            .iter()
            .filter(|s| s.channel == channel && !s.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Push `payload` into every open subscription on `channel`.
    ///
    /// Returns how many subscriptions accepted it.
    pub async fn deliver(&self, channel: &str, payload: Bytes) -> usize {
        let subscribers = self.subscribers.read().await;
        subscribers
            .iter()
            .filter(|s| s.channel == channel && !s.closed.load(Ordering::SeqCst))
            .filter(|s| s.sender.try_send(payload.clone()).is_ok())
            .count()
    }

    async fn record_subscribe(&self, channel: &str) -> Result<Subscription> {
        if *self.fail_on_subscribe.read().await {
            return Err(BusError::Subscribe {
                channel: channel.to_string(),
                message: "Mock subscribe failure".to_string(),
            });
        }
        let (sender, receiver) = mpsc::channel(16);
        let closed = Arc::new(AtomicBool::new(false));
        self.subscribers.write().await.push(MockSubscriber {
            channel: channel.to_string(),
            sender,
            closed: closed.clone(),
        });
        Ok(Subscription::new(
            channel,
            receiver,
            Box::new(MockUnsubscribe { closed }),
        ))
    }
}

#[async_trait]
impl MessageBus for MockMessageBus {
    async fn publish(&self, channel: &str, message: Bytes) -> Result<()> {
        if *self.fail_on_publish.read().await {
            return Err(BusError::Publish {
                channel: channel.to_string(),
                message: "Mock publish failure".to_string(),
            });
        }
        self.published.write().await.push(PublishedMessage {
            channel: channel.to_string(),
            payload: message,
        });
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.record_subscribe(channel).await
    }

    async fn subscribe_queue(&self, channel: &str, _group: &str) -> Result<Subscription> {
        self.record_subscribe(channel).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
