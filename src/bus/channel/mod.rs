//! In-memory message bus for standalone mode.
//!
//! Uses tokio mpsc channels for pub/sub within a single process.
//! Ideal for local development and testing without external dependencies.
//!
//! Fan-out subscribers on a channel each receive a copy of every message.
//! Queue-group members share delivery: each message goes to one member of
//! each group, chosen round-robin.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{BusError, MessageBus, Result, Subscription, Unsubscribe};
use crate::config::DEFAULT_CHANNEL_CAPACITY;

/// A single registered receiver.
struct Member {
    id: u64,
    sender: mpsc::Sender<Bytes>,
}

/// Members of one queue group plus the round-robin cursor.
#[derive(Default)]
struct QueueGroup {
    members: Vec<Member>,
    cursor: usize,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    closed: bool,
    fanout: HashMap<String, Vec<Member>>,
    /// channel -> group name -> members
    groups: HashMap<String, HashMap<String, QueueGroup>>,
}

impl Registry {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn remove(&mut self, key: &SubscriptionKey) {
        match &key.group {
            None => {
                if let Some(members) = self.fanout.get_mut(&key.channel) {
                    members.retain(|m| m.id != key.id);
                    if members.is_empty() {
                        self.fanout.remove(&key.channel);
                    }
                }
            }
            Some(group) => {
                if let Some(groups) = self.groups.get_mut(&key.channel) {
                    if let Some(queue) = groups.get_mut(group) {
                        queue.members.retain(|m| m.id != key.id);
                        if queue.members.is_empty() {
                            groups.remove(group);
                        }
                    }
                    if groups.is_empty() {
                        self.groups.remove(&key.channel);
                    }
                }
            }
        }
    }
}

/// Identifies one registration inside the registry.
#[derive(Clone, Debug)]
struct SubscriptionKey {
    channel: String,
    group: Option<String>,
    id: u64,
}

/// Removes a registration when its subscription is closed.
///
/// Holds a weak reference so a lingering subscription does not keep a closed
/// bus alive.
struct ChannelUnsubscribe {
    registry: Weak<Mutex<Registry>>,
    key: SubscriptionKey,
}

impl Unsubscribe for ChannelUnsubscribe {
    fn unsubscribe(&self) -> Result<()> {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(&self.key);
            debug!(
                channel = %self.key.channel,
                group = ?self.key.group,
                "Unsubscribed from channel"
            );
        }
        Ok(())
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    // Registry mutations never panic mid-update, so a poisoned lock still
    // holds consistent state.
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory message bus.
///
/// Cloning yields another handle onto the same bus, so separate
/// "instances" in a test can share one transport.
#[derive(Clone)]
pub struct ChannelMessageBus {
    registry: Arc<Mutex<Registry>>,
    capacity: usize,
}

impl ChannelMessageBus {
    /// Create a new in-memory bus with the default buffer capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new in-memory bus with a per-subscription buffer of `capacity`.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        info!(capacity, "Channel message bus initialized");
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            capacity,
        }
    }

    /// Number of live registrations on `channel` (fan-out plus queue members).
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let registry = lock(&self.registry);
        let fanout = registry.fanout.get(channel).map_or(0, Vec::len);
        let grouped = registry.groups.get(channel).map_or(0, |groups| {
            groups.values().map(|q| q.members.len()).sum()
        });
        fanout + grouped
    }

    fn register(&self, channel: &str, group: Option<&str>) -> Result<Subscription> {
        let (sender, receiver) = mpsc::channel(self.capacity);

        let key = {
            let mut registry = lock(&self.registry);
            if registry.closed {
                return Err(BusError::Closed);
            }
            let id = registry.allocate_id();
            let member = Member { id, sender };
            match group {
                None => registry
                    .fanout
                    .entry(channel.to_string())
                    .or_default()
                    .push(member),
                Some(group) => registry
                    .groups
                    .entry(channel.to_string())
                    .or_default()
                    .entry(group.to_string())
                    .or_default()
                    .members
                    .push(member),
            }
            SubscriptionKey {
                channel: channel.to_string(),
                group: group.map(str::to_string),
                id,
            }
        };

        debug!(channel = %channel, group = ?group, "Subscribed to channel");

        let unsubscribe = ChannelUnsubscribe {
            registry: Arc::downgrade(&self.registry),
            key,
        };
        Ok(Subscription::new(channel, receiver, Box::new(unsubscribe)))
    }
}

impl Default for ChannelMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of handing a message to one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Offer {
    Accepted,
    Full,
    Gone,
}

fn offer(member: &Member, message: &Bytes) -> Offer {
    match member.sender.try_send(message.clone()) {
        Ok(()) => Offer::Accepted,
        Err(mpsc::error::TrySendError::Full(_)) => Offer::Full,
        Err(mpsc::error::TrySendError::Closed(_)) => Offer::Gone,
    }
}

/// Deliver to one member of `queue`, starting at the cursor.
///
/// Members whose subscription was dropped are pruned; full members are
/// skipped. Returns false when no member could take the message.
fn offer_to_group(queue: &mut QueueGroup, message: &Bytes) -> bool {
    let mut attempts = queue.members.len();
    while attempts > 0 && !queue.members.is_empty() {
        let index = queue.cursor % queue.members.len();
        match offer(&queue.members[index], message) {
            Offer::Accepted => {
                queue.cursor = index + 1;
                return true;
            }
            Offer::Full => {
                queue.cursor = index + 1;
                attempts -= 1;
            }
            Offer::Gone => {
                queue.members.remove(index);
            }
        }
    }
    false
}

#[async_trait]
impl MessageBus for ChannelMessageBus {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(channel = %channel))]
    async fn publish(&self, channel: &str, message: Bytes) -> Result<()> {
        let mut registry = lock(&self.registry);
        if registry.closed {
            return Err(BusError::Closed);
        }

        let mut receivers = 0usize;

        if let Some(members) = registry.fanout.get_mut(channel) {
            members.retain(|member| match offer(member, &message) {
                Offer::Accepted => {
                    receivers += 1;
                    true
                }
                Offer::Full => {
                    warn!(channel = %channel, "Subscriber buffer full, message dropped");
                    true
                }
                Offer::Gone => false,
            });
        }

        if let Some(groups) = registry.groups.get_mut(channel) {
            for (group, queue) in groups.iter_mut() {
                if offer_to_group(queue, &message) {
                    receivers += 1;
                } else if !queue.members.is_empty() {
                    warn!(channel = %channel, group = %group, "Every group member is full, message dropped");
                }
            }
            groups.retain(|_, queue| !queue.members.is_empty());
        }

        debug!(channel = %channel, receivers, "Published message to channel");

        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        self.register(channel, None)
    }

    async fn subscribe_queue(&self, channel: &str, group: &str) -> Result<Subscription> {
        self.register(channel, Some(group))
    }

    async fn close(&self) -> Result<()> {
        let mut registry = lock(&self.registry);
        if registry.closed {
            return Ok(());
        }
        registry.closed = true;
        // Dropping the senders ends every open subscription stream.
        registry.fanout.clear();
        registry.groups.clear();
        info!("Channel message bus closed");
        Ok(())
    }
}
