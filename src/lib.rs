//! ingress-rpc - correlated request/response over pub/sub.
//!
//! Turns a fire-and-forget message bus into request/response exchanges
//! between server instances that share no memory. Requests travel on
//! entity-scoped or queue-grouped channels; each call awaits its answer on a
//! private response channel named after its correlation id. State changes
//! are broadcast separately through the [`notifier::Notifier`].

pub mod bus;
pub mod channels;
pub mod config;
pub mod envelope;
pub mod identity;
pub mod notifier;
pub mod rpc;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bus::{init_message_bus, BusError, MessageBus, Subscription};
pub use config::Config;
pub use identity::NodeId;
pub use notifier::{Notifier, UpdateObserver};
pub use rpc::{Dispatcher, RequestHandler, Responder, RpcClient, RpcError};
