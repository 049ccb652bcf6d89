//! Bootstrap utilities for processes embedding the RPC layer.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LOG_ENV_VAR;

/// Initialize tracing with the INGRESS_RPC_LOG environment variable.
///
/// Defaults to "info" level if INGRESS_RPC_LOG is not set. A subscriber
/// installed earlier is left in place.
pub fn init_tracing() {
    let installed = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if installed.is_err() {
        tracing::debug!("Global tracing subscriber already installed");
    }
}
