//! Backoff configuration for transport connections.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for the NATS message bus connection at startup: 100ms growing to
/// 5s between attempts, at most 30 attempts, with jitter.
///
/// Used by `NatsMessageBus::connect_with_retry`; the in-memory bus needs no
/// connection.
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}
