//! RPC timing and grouping configuration.

use std::time::Duration;

use serde::Deserialize;

/// Default bound on how long a caller waits for a response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
/// Default age past which a responder refuses a request.
pub const DEFAULT_REQUEST_EXPIRATION: Duration = Duration::from_secs(2);
/// Default queue group for shared entity lookups.
pub const DEFAULT_ENTITY_GROUP: &str = "ingress";

/// RPC client and responder settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// How long `call` waits for a response, in milliseconds.
    pub request_timeout_ms: u64,
    /// Requests older than this on receipt are answered with an
    /// expiration error instead of being handled. 0 disables the check.
    pub request_expiration_ms: u64,
    /// Queue group joined by responders on the shared entity channel.
    pub entity_group: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            request_expiration_ms: DEFAULT_REQUEST_EXPIRATION.as_millis() as u64,
            entity_group: DEFAULT_ENTITY_GROUP.to_string(),
        }
    }
}

impl RpcConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn request_expiration(&self) -> Option<Duration> {
        match self.request_expiration_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
