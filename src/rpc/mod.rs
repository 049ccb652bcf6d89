//! Correlated request/response over the message bus.
//!
//! - [`RpcClient`]: publishes a request and waits for the one response on a
//!   private `RES_<correlation id>` channel
//! - [`Responder`]: answers requests arriving on entity-scoped or
//!   queue-grouped channels
//! - [`RequestHandler`] / [`Dispatcher`]: business logic seam

pub mod client;
pub mod handler;
pub mod server;

pub use client::RpcClient;
pub use handler::{Dispatcher, HandlerError, HandlerResult, RequestContext, RequestHandler};
pub use server::Responder;

use crate::bus::BusError;

/// Result type for RPC calls.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Every way an in-flight call can end without a payload.
///
/// None of these are retried internally; callers decide, typically by
/// checking [`RpcError::is_timeout`].
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Publish or subscribe failed before the request left.
    #[error("Transport error: {0}")]
    Transport(#[from] BusError),

    /// Nothing arrived on the response channel within the request timeout.
    #[error("no response from remote service")]
    NoResponse,

    /// A message arrived but could not be parsed.
    #[error("Failed to decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: prost::DecodeError,
    },

    /// The request payload could not be encoded.
    #[error("Failed to encode request: {0}")]
    Encode(#[from] prost::EncodeError),

    /// The handler ran and reported failure; carries its error text.
    #[error("{0}")]
    Application(String),

    /// The response succeeded but carried no payload where one was expected.
    #[error("Response carried no payload")]
    MissingPayload,

    /// The caller's cancellation token fired before a response arrived.
    #[error("Call cancelled")]
    Cancelled,
}

impl RpcError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::NoResponse)
    }

    /// Handler error text, if this is an application-level failure.
    pub fn application_message(&self) -> Option<&str> {
        match self {
            Self::Application(message) => Some(message),
            _ => None,
        }
    }
}
