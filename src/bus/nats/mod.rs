//! NATS message bus implementation.
//!
//! Maps the bus contract directly onto NATS core pub/sub:
//! - `publish` → `PUB <channel>`
//! - `subscribe` → plain subscription (fan-out)
//! - `subscribe_queue` → queue subscription (NATS queue groups give
//!   competing-consumer delivery natively)
//!
//! Subscriptions are registered on the same connection that later publishes,
//! so a response subscription made before a request publish is always known
//! to the server first.
//!
//! # Configuration
//!
//! ```yaml
//! messaging:
//!   type: nats
//!   nats:
//!     url: "nats://localhost:4222"
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::Client;
use async_trait::async_trait;
use backon::Retryable;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BusError, MessageBus, Result, Subscription, Unsubscribe};
use crate::utils::retry::connection_backoff;

/// Buffer between the NATS subscriber and the `Subscription` reader.
const FORWARD_CAPACITY: usize = 256;

/// NATS-based message bus.
pub struct NatsMessageBus {
    client: Client,
    url: String,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

/// Stops the forwarding task; dropping the NATS subscriber sends UNSUB.
struct NatsUnsubscribe {
    task: AbortHandle,
}

impl Unsubscribe for NatsUnsubscribe {
    fn unsubscribe(&self) -> Result<()> {
        self.task.abort();
        Ok(())
    }
}

impl NatsMessageBus {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url = %url, "Connecting to NATS");

        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        info!(url = %url, "Connected to NATS");

        Ok(Self::from_client(client, url))
    }

    /// Connect with exponential backoff, for process startup.
    pub async fn connect_with_retry(url: &str) -> Result<Self> {
        (|| Self::connect(url))
            .retry(connection_backoff())
            .notify(|err: &BusError, dur: Duration| {
                warn!(url = %url, error = %err, delay = ?dur, "NATS connection failed, retrying");
            })
            .await
    }

    /// Wrap an existing client (shared with other components).
    pub fn from_client(client: Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_string(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Get the connection URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        Ok(())
    }

    /// Pump messages from a NATS subscriber into a `Subscription`.
    fn forward(&self, channel: &str, mut subscriber: async_nats::Subscriber) -> Subscription {
        let (sender, receiver) = mpsc::channel(FORWARD_CAPACITY);
        let shutdown = self.shutdown.clone();
        let subject = channel.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    message = subscriber.next() => match message {
                        Some(message) => {
                            if sender.send(message.payload).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!(channel = %subject, "NATS forwarding task stopped");
        });

        Subscription::new(
            channel,
            receiver,
            Box::new(NatsUnsubscribe {
                task: task.abort_handle(),
            }),
        )
    }
}

#[async_trait]
impl MessageBus for NatsMessageBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(channel = %channel))]
    async fn publish(&self, channel: &str, message: Bytes) -> Result<()> {
        self.ensure_open()?;

        self.client
            .publish(channel.to_string(), message)
            .await
            .map_err(|e| BusError::Publish {
                channel: channel.to_string(),
                message: e.to_string(),
            })?;

        debug!(channel = %channel, "Published message to NATS");
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.ensure_open()?;

        let subscriber = self
            .client
            .subscribe(channel.to_string())
            .await
            .map_err(|e| BusError::Subscribe {
                channel: channel.to_string(),
                message: e.to_string(),
            })?;

        debug!(channel = %channel, "Subscribed to NATS subject");
        Ok(self.forward(channel, subscriber))
    }

    async fn subscribe_queue(&self, channel: &str, group: &str) -> Result<Subscription> {
        self.ensure_open()?;

        let subscriber = self
            .client
            .queue_subscribe(channel.to_string(), group.to_string())
            .await
            .map_err(|e| BusError::Subscribe {
                channel: channel.to_string(),
                message: e.to_string(),
            })?;

        debug!(channel = %channel, group = %group, "Queue-subscribed to NATS subject");
        Ok(self.forward(channel, subscriber))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        info!(url = %self.url, "NATS message bus closed");
        Ok(())
    }
}
