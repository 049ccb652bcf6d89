//! Channel naming scheme.
//!
//! Producers and consumers derive channel names from identifiers alone, with
//! no registry in between. The prefixes and fixed names are part of the wire
//! contract between instances of possibly different builds.

/// Prefix for entity-scoped request channels.
pub const REQUEST_CHANNEL_PREFIX: &str = "REQ_";
/// Prefix for per-call response channels.
pub const RESPONSE_CHANNEL_PREFIX: &str = "RES_";
/// Fan-out channel carrying state-change notifications.
pub const UPDATE_CHANNEL: &str = "IN_RESULTS";
/// Queue-grouped channel for requests any live instance may answer.
pub const ENTITY_CHANNEL: &str = "IN_ENTITY";

/// Channel on which the owner of `target_id` receives requests.
pub fn request_channel(target_id: &str) -> String {
    format!("{}{}", REQUEST_CHANNEL_PREFIX, target_id)
}

/// Channel on which the caller awaits the response to `correlation_id`.
pub fn response_channel(correlation_id: &str) -> String {
    format!("{}{}", RESPONSE_CHANNEL_PREFIX, correlation_id)
}
