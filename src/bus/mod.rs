//! Message bus abstraction.
//!
//! This module contains:
//! - `MessageBus` trait: fan-out and queue-grouped publish/subscribe
//! - `Subscription`: a lazily consumed stream of raw messages with idempotent close
//! - Bus configuration and factory
//! - Implementations: in-memory channel, NATS, Mock, Lossy (testing)

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::{error, info};

// Implementation modules
#[cfg(feature = "channel")]
pub mod channel;
#[cfg(feature = "lossy")]
pub mod lossy;
pub mod mock;
#[cfg(feature = "nats")]
pub mod nats;

// Re-exports
#[cfg(feature = "channel")]
pub use channel::ChannelMessageBus;
#[cfg(feature = "lossy")]
pub use lossy::{Direction, LossyConfig, LossyMessageBus};
pub use mock::MockMessageBus;
#[cfg(feature = "nats")]
pub use nats::NatsMessageBus;

pub use crate::config::{ChannelBusConfig, MessagingConfig, MessagingType, NatsConfig};

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish to '{channel}' failed: {message}")]
    Publish { channel: String, message: String },

    #[error("Subscribe to '{channel}' failed: {message}")]
    Subscribe { channel: String, message: String },

    #[error("Unsubscribe from '{channel}' failed: {message}")]
    Unsubscribe { channel: String, message: String },

    #[error("Message bus is closed")]
    Closed,
}

/// Transport primitive shared by every RPC client, responder and notifier.
///
/// Publish is fire-and-forget: `Ok(())` means the message was handed to the
/// transport, not that anyone received it. Failures surface immediately and
/// are never retried here.
///
/// Implementations:
/// - `ChannelMessageBus`: in-process, for standalone mode and tests
/// - `NatsMessageBus`: NATS core pub/sub with native queue groups
/// - `MockMessageBus`: records publishes for assertions
/// - `LossyMessageBus`: drops a fraction of requests or responses
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a raw message to every subscriber of `channel`.
    async fn publish(&self, channel: &str, message: Bytes) -> Result<()>;

    /// Fan-out subscription: receives every message published to `channel`
    /// after this call returns.
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;

    /// Competing-consumer subscription: each message published to `channel`
    /// is delivered to exactly one member of `group`.
    async fn subscribe_queue(&self, channel: &str, group: &str) -> Result<Subscription>;

    /// Close the connection. Open subscriptions end and further publishes fail.
    async fn close(&self) -> Result<()>;
}

/// Releases the transport-side registration of a subscription.
pub trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self) -> Result<()>;
}

/// A live subscription on one channel.
///
/// Messages are pulled with [`Subscription::next`] or through the
/// [`Stream`] impl. The sequence ends once the subscription is closed or the
/// bus shuts down. Dropping a subscription closes it.
pub struct Subscription {
    channel: String,
    receiver: mpsc::Receiver<Bytes>,
    unsubscribe: Option<Box<dyn Unsubscribe>>,
}

impl Subscription {
    /// Create a subscription fed by `receiver`.
    ///
    /// `unsubscribe` runs exactly once, on the first `close()` or on drop.
    pub fn new(
        channel: impl Into<String>,
        receiver: mpsc::Receiver<Bytes>,
        unsubscribe: Box<dyn Unsubscribe>,
    ) -> Self {
        Self {
            channel: channel.into(),
            receiver,
            unsubscribe: Some(unsubscribe),
        }
    }

    /// Channel this subscription listens on.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Whether `close()` has already run.
    pub fn is_closed(&self) -> bool {
        self.unsubscribe.is_none()
    }

    /// Wait for the next raw message. Returns `None` once closed.
    pub async fn next(&mut self) -> Option<Bytes> {
        if self.is_closed() {
            return None;
        }
        self.receiver.recv().await
    }

    /// Release the subscription. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<()> {
        match self.unsubscribe.take() {
            Some(unsubscribe) => {
                self.receiver.close();
                unsubscribe.unsubscribe()
            }
            None => Ok(()),
        }
    }
}

impl Stream for Subscription {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.is_closed() {
            return Poll::Ready(None);
        }
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!(channel = %self.channel, error = %e, "Failed to unsubscribe on drop");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize the message bus based on configuration.
///
/// Returns the appropriate MessageBus implementation based on messaging_type.
/// Requires the corresponding feature to be enabled:
/// - Channel: `--features channel` (included in default)
/// - NATS: `--features nats`
pub async fn init_message_bus(
    config: &MessagingConfig,
) -> std::result::Result<Arc<dyn MessageBus>, Box<dyn std::error::Error + Send + Sync>> {
    match config.messaging_type {
        MessagingType::Channel => {
            #[cfg(feature = "channel")]
            {
                let bus = ChannelMessageBus::with_capacity(config.channel.capacity);
                info!(messaging_type = "channel", "Message bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "channel"))]
            {
                Err("Channel bus requires the 'channel' feature. Rebuild with --features channel".into())
            }
        }
        MessagingType::Nats => {
            #[cfg(feature = "nats")]
            {
                let bus = NatsMessageBus::connect_with_retry(&config.nats.url).await?;
                info!(messaging_type = "nats", url = %config.nats.url, "Message bus initialized");
                Ok(Arc::new(bus))
            }

            #[cfg(not(feature = "nats"))]
            {
                Err("NATS support requires the 'nats' feature. Rebuild with --features nats".into())
            }
        }
    }
}
