//! Messaging and message bus configuration types.

use serde::Deserialize;

/// Default per-subscription buffer of the in-process bus.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Messaging type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process messaging (no external broker).
    #[default]
    Channel,
    /// NATS core pub/sub.
    Nats,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// In-process bus configuration.
    pub channel: ChannelBusConfig,
    /// NATS-specific configuration.
    pub nats: NatsConfig,
}

/// In-process bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelBusConfig {
    /// Per-subscription buffer size; messages beyond it are dropped.
    pub capacity: usize,
}

impl Default for ChannelBusConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// NATS-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// NATS server URL.
    pub url: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
        }
    }
}
