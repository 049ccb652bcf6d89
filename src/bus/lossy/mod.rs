//! Message bus wrapper that loses requests or responses in flight.
//!
//! Publishes are classified by channel name. Requests go to `REQ_*` or
//! `IN_ENTITY`, responses to `RES_*`. Each direction has its own drop rate,
//! so a test can lose the request before any handler runs, or lose the
//! answer after the handler already ran. The caller sees a timeout either
//! way. Everything else, including subscriptions, passes through.
//!
//! ```ignore
//! use ingress_rpc::bus::{ChannelMessageBus, LossyConfig, LossyMessageBus};
//!
//! let bus = LossyMessageBus::new(
//!     ChannelMessageBus::new(),
//!     LossyConfig::default().drop_responses(0.1),
//! );
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tracing::{debug, warn};

use super::{MessageBus, Result, Subscription};
use crate::channels::{ENTITY_CHANNEL, REQUEST_CHANNEL_PREFIX, RESPONSE_CHANNEL_PREFIX};

/// Which leg of an exchange a publish belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
    /// Updates and any channel outside the RPC naming scheme. Never dropped.
    Other,
}

impl Direction {
    pub fn of(channel: &str) -> Self {
        if channel.starts_with(REQUEST_CHANNEL_PREFIX) || channel == ENTITY_CHANNEL {
            Self::Request
        } else if channel.starts_with(RESPONSE_CHANNEL_PREFIX) {
            Self::Response
        } else {
            Self::Other
        }
    }
}

/// Drop probabilities per direction, each in `0.0..=1.0`.
#[derive(Clone, Debug, Default)]
pub struct LossyConfig {
    request_drop_rate: f64,
    response_drop_rate: f64,
}

impl LossyConfig {
    /// Lose requests with probability `rate` (clamped).
    pub fn drop_requests(mut self, rate: f64) -> Self {
        self.request_drop_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Lose responses with probability `rate` (clamped).
    pub fn drop_responses(mut self, rate: f64) -> Self {
        self.response_drop_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn drop_rate(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Request => self.request_drop_rate,
            Direction::Response => self.response_drop_rate,
            Direction::Other => 0.0,
        }
    }
}

/// Dropped publish counts per direction.
#[derive(Debug, Default)]
pub struct LossyStats {
    requests_dropped: AtomicU64,
    responses_dropped: AtomicU64,
}

impl LossyStats {
    pub fn requests_dropped(&self) -> u64 {
        self.requests_dropped.load(Ordering::Relaxed)
    }

    pub fn responses_dropped(&self) -> u64 {
        self.responses_dropped.load(Ordering::Relaxed)
    }

    fn record(&self, direction: Direction) {
        let counter = match direction {
            Direction::Request => &self.requests_dropped,
            Direction::Response => &self.responses_dropped,
            Direction::Other => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct LossyMessageBus<B: MessageBus> {
    inner: B,
    config: LossyConfig,
    stats: LossyStats,
}

impl<B: MessageBus> LossyMessageBus<B> {
    pub fn new(inner: B, config: LossyConfig) -> Self {
        warn!(
            request_drop_rate = config.request_drop_rate,
            response_drop_rate = config.response_drop_rate,
            "Lossy message bus enabled"
        );
        Self {
            inner,
            config,
            stats: LossyStats::default(),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn stats(&self) -> &LossyStats {
        &self.stats
    }

    fn should_drop(&self, direction: Direction) -> bool {
        let rate = self.config.drop_rate(direction);
        rate > 0.0 && rand::rng().random_bool(rate)
    }
}

#[async_trait]
impl<B: MessageBus> MessageBus for LossyMessageBus<B> {
    async fn publish(&self, channel: &str, message: Bytes) -> Result<()> {
        let direction = Direction::of(channel);
        if self.should_drop(direction) {
            self.stats.record(direction);
            debug!(channel = %channel, direction = ?direction, "Lossy bus dropped message");
            // The publisher is not told.
            return Ok(());
        }
        self.inner.publish(channel, message).await
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.inner.subscribe(channel).await
    }

    async fn subscribe_queue(&self, channel: &str, group: &str) -> Result<Subscription> {
        self.inner.subscribe_queue(channel, group).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
