//! Instance identity and correlation id generation.

use std::fmt;

use uuid::Uuid;

/// Prefix for correlation ids.
pub const RPC_PREFIX: &str = "RPC_";
/// Prefix for generated node ids.
pub const NODE_PREFIX: &str = "ND_";

const GUID_LEN: usize = 12;
const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Generate `prefix` followed by 12 random base62 characters.
pub fn new_guid(prefix: &str) -> String {
    let mut value = Uuid::new_v4().as_u128();
    let mut id = String::with_capacity(prefix.len() + GUID_LEN);
    id.push_str(prefix);
    for _ in 0..GUID_LEN {
        id.push(ALPHABET[(value % 62) as usize] as char);
        value /= 62;
    }
    id
}

/// Stable identity of this server instance, stamped into every request as
/// the sender.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random node id, for instances without a configured identity.
    pub fn generate() -> Self {
        Self(new_guid(NODE_PREFIX))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Source of collision-resistant correlation ids.
pub trait CorrelationIdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

/// Default generator: `RPC_` plus 12 random base62 characters.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl CorrelationIdGenerator for UuidGenerator {
    fn next_id(&self) -> String {
        new_guid(RPC_PREFIX)
    }
}
