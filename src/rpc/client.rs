//! RPC client: correlated request/response on top of pub/sub.
//!
//! Each call generates a fresh correlation id, subscribes to
//! `RES_<correlation id>` *before* publishing the request, and waits for the
//! first matching response, the request timeout, or caller cancellation,
//! whichever comes first. Cancellation also interrupts a stalled subscribe
//! or publish. The response subscription belongs to the call and
//! is closed on every return path; dropping the call future closes it too.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use prost::Message;
use prost_types::Any;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{Result, RpcError};
use crate::bus::{MessageBus, Subscription};
use crate::channels::{request_channel, response_channel, ENTITY_CHANNEL};
use crate::config::{RpcConfig, DEFAULT_REQUEST_TIMEOUT};
use crate::envelope::{encode, now_nanos, RequestEnvelope, ResponseEnvelope};
use crate::identity::{CorrelationIdGenerator, NodeId, UuidGenerator};

/// Issues requests and awaits their correlated responses.
///
/// Cheap to clone; clones share the bus connection.
#[derive(Clone)]
pub struct RpcClient {
    node_id: NodeId,
    bus: Arc<dyn MessageBus>,
    ids: Arc<dyn CorrelationIdGenerator>,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(node_id: NodeId, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            node_id,
            bus,
            ids: Arc::new(UuidGenerator),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn from_config(node_id: NodeId, config: &RpcConfig, bus: Arc<dyn MessageBus>) -> Self {
        Self::new(node_id, bus).with_timeout(config.request_timeout())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn CorrelationIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `request` to the owner of `target_id` and wait for its answer.
    ///
    /// Returns the response payload, which is `None` when the handler
    /// succeeded without producing one.
    pub async fn call(&self, target_id: &str, request: Any) -> Result<Option<Any>> {
        self.exchange(&request_channel(target_id), target_id, request, None)
            .await
    }

    /// Like [`RpcClient::call`], aborting early when `cancel` fires.
    pub async fn call_with_cancel(
        &self,
        target_id: &str,
        request: Any,
        cancel: &CancellationToken,
    ) -> Result<Option<Any>> {
        self.exchange(&request_channel(target_id), target_id, request, Some(cancel))
            .await
    }

    /// Send an un-targeted request; exactly one live responder in the entity
    /// group answers.
    pub async fn call_entity(&self, request: Any) -> Result<Option<Any>> {
        self.exchange(ENTITY_CHANNEL, "", request, None).await
    }

    /// Like [`RpcClient::call_entity`], aborting early when `cancel` fires.
    pub async fn call_entity_with_cancel(
        &self,
        request: Any,
        cancel: &CancellationToken,
    ) -> Result<Option<Any>> {
        self.exchange(ENTITY_CHANNEL, "", request, Some(cancel)).await
    }

    /// Typed [`RpcClient::call`]: wraps `request` in `Any` and decodes the
    /// response payload as `R`.
    pub async fn send_request<M, R>(&self, target_id: &str, request: &M) -> Result<R>
    where
        M: prost::Name,
        R: prost::Name + Default,
    {
        let payload = self.call(target_id, Any::from_msg(request)?).await?;
        unpack(payload)
    }

    /// Typed [`RpcClient::call_entity`].
    pub async fn send_entity_request<M, R>(&self, request: &M) -> Result<R>
    where
        M: prost::Name,
        R: prost::Name + Default,
    {
        let payload = self.call_entity(Any::from_msg(request)?).await?;
        unpack(payload)
    }

    #[tracing::instrument(
        name = "rpc.call",
        skip_all,
        fields(channel = %channel, correlation_id)
    )]
    async fn exchange(
        &self,
        channel: &str,
        target_id: &str,
        payload: Any,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Any>> {
        let correlation_id = self.ids.next_id();
        tracing::Span::current().record("correlation_id", correlation_id.as_str());

        let reply_channel = response_channel(&correlation_id);
        let mut subscription = tokio::select! {
            biased;
            _ = cancelled(cancel) => return Err(RpcError::Cancelled),
            subscription = self.bus.subscribe(&reply_channel) => subscription?,
        };

        let request = RequestEnvelope {
            correlation_id,
            sender_id: self.node_id.to_string(),
            target_id: target_id.to_string(),
            sent_at: now_nanos(),
            payload: Some(payload),
        };

        let outcome = self
            .await_response(&mut subscription, channel, &request, cancel)
            .await;

        if let Err(e) = subscription.close() {
            error!(
                correlation_id = %request.correlation_id,
                error = %e,
                "Failed to close response subscription"
            );
        }

        outcome
    }

    async fn await_response(
        &self,
        subscription: &mut Subscription,
        channel: &str,
        request: &RequestEnvelope,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Any>> {
        tokio::select! {
            biased;
            _ = cancelled(cancel) => return Err(RpcError::Cancelled),
            published = self.bus.publish(channel, encode(request)) => published?,
        }
        debug!(channel = %channel, "Request published");

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            let message = tokio::select! {
                _ = &mut deadline => {
                    debug!(timeout = ?self.timeout, "No response before timeout");
                    return Err(RpcError::NoResponse);
                }
                _ = cancelled(cancel) => return Err(RpcError::Cancelled),
                message = subscription.next() => message,
            };

            let Some(message) = message else {
                return Err(crate::bus::BusError::Closed.into());
            };

            match accept(message, &request.correlation_id)? {
                Some(response) => return response,
                None => continue,
            }
        }
    }
}

/// Decode a response and check it belongs to `correlation_id`.
///
/// `Ok(None)` means the message should be ignored.
fn accept(message: Bytes, correlation_id: &str) -> Result<Option<Result<Option<Any>>>> {
    let response = ResponseEnvelope::decode(message).map_err(|source| RpcError::Decode {
        what: "response envelope",
        source,
    })?;

    if response.correlation_id != correlation_id {
        warn!(
            expected = %correlation_id,
            received = %response.correlation_id,
            "Ignoring response with mismatched correlation id"
        );
        return Ok(None);
    }

    if response.is_error() {
        return Ok(Some(Err(RpcError::Application(response.error))));
    }
    Ok(Some(Ok(response.payload)))
}

fn unpack<R: prost::Name + Default>(payload: Option<Any>) -> Result<R> {
    payload
        .ok_or(RpcError::MissingPayload)?
        .to_msg()
        .map_err(|source| RpcError::Decode {
            what: "response payload",
            source,
        })
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
