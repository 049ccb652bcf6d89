//! Responder: answers correlated requests arriving on the bus.
//!
//! A responder listens on any number of bindings:
//! - entity-scoped: fan-out subscription to `REQ_<entity id>` for an entity
//!   this instance owns
//! - queue-grouped: competing-consumer subscription to a shared channel,
//!   typically `IN_ENTITY`
//!
//! Every decodable request with a correlation id gets exactly one response
//! on `RES_<correlation id>`, carrying either the handler's payload or its
//! error text. Handler panics are reported the same way.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use prost::Message;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::handler::{HandlerError, HandlerResult, RequestContext, RequestHandler};
use super::Result;
use crate::bus::{MessageBus, Subscription};
use crate::channels::{request_channel, response_channel, ENTITY_CHANNEL};
use crate::config::{RpcConfig, DEFAULT_ENTITY_GROUP, DEFAULT_REQUEST_EXPIRATION};
use crate::envelope::{encode, now_nanos, RequestEnvelope, ResponseEnvelope};
use crate::identity::NodeId;

/// Where a responder listens.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Binding {
    Entity(String),
    Queue { channel: String, group: String },
}

impl Binding {
    fn channel(&self) -> String {
        match self {
            Self::Entity(id) => request_channel(id),
            Self::Queue { channel, .. } => channel.clone(),
        }
    }

    async fn open(&self, bus: &dyn MessageBus) -> crate::bus::Result<Subscription> {
        match self {
            Self::Entity(id) => bus.subscribe(&request_channel(id)).await,
            Self::Queue { channel, group } => bus.subscribe_queue(channel, group).await,
        }
    }
}

/// A running listener task for one binding.
struct Listener {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    started: bool,
    /// Set by `shutdown` and `kill`; no listener starts afterwards.
    stopping: bool,
    /// Bindings registered before the handler was set.
    pending: Vec<Binding>,
    /// Keyed by channel name.
    listeners: BTreeMap<String, Listener>,
}

type HandlerSlot = Arc<RwLock<Option<Arc<dyn RequestHandler>>>>;

/// What a listener task needs to answer requests.
struct Worker {
    bus: Arc<dyn MessageBus>,
    expiration: Option<Duration>,
    handler: HandlerSlot,
}

impl Worker {
    fn handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.handler
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Serves requests for the entities and groups it is bound to.
pub struct Responder {
    node_id: NodeId,
    bus: Arc<dyn MessageBus>,
    expiration: Option<Duration>,
    entity_group: String,
    handler: HandlerSlot,
    state: Mutex<State>,
}

impl Responder {
    pub fn new(node_id: NodeId, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            node_id,
            bus,
            expiration: Some(DEFAULT_REQUEST_EXPIRATION),
            entity_group: DEFAULT_ENTITY_GROUP.to_string(),
            handler: Arc::new(RwLock::new(None)),
            state: Mutex::new(State::default()),
        }
    }

    pub fn from_config(node_id: NodeId, config: &RpcConfig, bus: Arc<dyn MessageBus>) -> Self {
        Self::new(node_id, bus)
            .with_expiration(config.request_expiration())
            .with_entity_group(config.entity_group.clone())
    }

    /// Refuse requests older than `expiration` on receipt. `None` disables.
    pub fn with_expiration(mut self, expiration: Option<Duration>) -> Self {
        self.expiration = expiration;
        self
    }

    /// Queue group joined on `IN_ENTITY`.
    pub fn with_entity_group(mut self, group: impl Into<String>) -> Self {
        self.entity_group = group.into();
        self
    }

    /// Serve requests addressed to `entity_id`.
    pub fn entity(self, entity_id: impl Into<String>) -> Self {
        self.bind(Binding::Entity(entity_id.into()))
    }

    /// Serve un-targeted requests on `IN_ENTITY` as a member of the entity group.
    pub fn entity_lookup(self) -> Self {
        let group = self.entity_group.clone();
        self.queue(ENTITY_CHANNEL, group)
    }

    /// Serve requests on `channel` as a member of `group`.
    pub fn queue(self, channel: impl Into<String>, group: impl Into<String>) -> Self {
        self.bind(Binding::Queue {
            channel: channel.into(),
            group: group.into(),
        })
    }

    fn bind(self, binding: Binding) -> Self {
        self.lock().pending.push(binding);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Channels with a running listener.
    pub fn channels(&self) -> Vec<String> {
        self.lock().listeners.keys().cloned().collect()
    }

    /// Bind the business logic and open every registered binding.
    ///
    /// Calling it again swaps the handler for subsequent requests; listeners
    /// keep running. If a binding fails to open, it and every binding not
    /// yet opened stay registered and the next call retries them.
    pub async fn set_handler(&self, handler: impl RequestHandler + 'static) -> Result<()> {
        *self
            .handler
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(handler));

        // A binding leaves `pending` only once its listener is running.
        loop {
            let binding = {
                let mut state = self.lock();
                if state.pending.is_empty() {
                    state.started = true;
                    return Ok(());
                }
                state.pending.remove(0)
            };
            if let Err(e) = self.start(binding.clone()).await {
                self.lock().pending.insert(0, binding);
                return Err(e);
            }
        }
    }

    /// Start serving `entity_id`, now if running or once a handler is set.
    pub async fn add_entity(&self, entity_id: &str) -> Result<()> {
        let binding = Binding::Entity(entity_id.to_string());
        {
            let mut state = self.lock();
            if !state.started {
                state.pending.push(binding);
                return Ok(());
            }
        }
        self.start(binding).await
    }

    /// Stop serving `entity_id`, letting in-flight requests finish.
    pub async fn remove_entity(&self, entity_id: &str) {
        let channel = request_channel(entity_id);
        let listener = {
            let mut state = self.lock();
            state
                .pending
                .retain(|b| !matches!(b, Binding::Entity(id) if id == entity_id));
            state.listeners.remove(&channel)
        };
        if let Some(listener) = listener {
            stop_gracefully(channel, listener).await;
        }
    }

    /// Stop accepting requests and wait for in-flight handling to finish.
    ///
    /// The responder does not serve again afterwards.
    pub async fn shutdown(&self) {
        let listeners = self.stop_all();
        for (channel, listener) in listeners {
            stop_gracefully(channel, listener).await;
        }
        info!(node_id = %self.node_id, "Responder shut down");
    }

    /// Close every binding immediately, aborting in-flight handling.
    pub async fn kill(&self) {
        let listeners = self.stop_all();
        for (_, listener) in listeners {
            listener.task.abort();
            // Dropping the aborted task closes its subscription and in-flight set.
            let _ = listener.task.await;
        }
        warn!(node_id = %self.node_id, "Responder killed");
    }

    /// Raw subscription to requests for `entity_id`, for callers running
    /// their own receive loop. Pair with [`Responder::send_response`].
    pub async fn subscribe_entity(&self, entity_id: &str) -> Result<Subscription> {
        Ok(self.bus.subscribe(&request_channel(entity_id)).await?)
    }

    /// Raw queue-grouped subscription to un-targeted requests on `IN_ENTITY`.
    pub async fn entity_subscription(&self) -> Result<Subscription> {
        Ok(self
            .bus
            .subscribe_queue(ENTITY_CHANNEL, &self.entity_group)
            .await?)
    }

    /// Publish the response to `request`.
    pub async fn send_response(&self, request: &RequestEnvelope, result: HandlerResult) -> Result<()> {
        Ok(publish_response(self.bus.as_ref(), &request.correlation_id, result).await?)
    }

    fn stop_all(&self) -> BTreeMap<String, Listener> {
        let mut state = self.lock();
        state.stopping = true;
        state.pending.clear();
        std::mem::take(&mut state.listeners)
    }

    async fn start(&self, binding: Binding) -> Result<()> {
        let channel = binding.channel();
        {
            let state = self.lock();
            if state.stopping {
                debug!(channel = %channel, "Responder stopped, not listening");
                return Ok(());
            }
            if state.listeners.contains_key(&channel) {
                debug!(channel = %channel, "Already listening");
                return Ok(());
            }
        }

        let subscription = binding.open(self.bus.as_ref()).await?;
        let stop = CancellationToken::new();
        let worker = Arc::new(Worker {
            bus: self.bus.clone(),
            expiration: self.expiration,
            handler: self.handler.clone(),
        });
        let task = tokio::spawn(listen(worker, subscription, stop.clone()));

        let listener = Listener { stop, task };

        // Either the listener replaced by a concurrent start of the same
        // binding, or this one if the responder stopped while it was opening.
        let discard = {
            let mut state = self.lock();
            if state.stopping {
                Some(listener)
            } else {
                info!(channel = %channel, binding = ?binding, "Responder listening");
                state.listeners.insert(channel.clone(), listener)
            }
        };
        if let Some(listener) = discard {
            stop_gracefully(channel, listener).await;
        }
        Ok(())
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        for listener in self.lock().listeners.values() {
            listener.stop.cancel();
        }
    }
}

async fn stop_gracefully(channel: String, listener: Listener) {
    listener.stop.cancel();
    if let Err(e) = listener.task.await {
        error!(channel = %channel, error = %e, "Listener task failed");
    }
    debug!(channel = %channel, "Listener stopped");
}

/// Receive loop for one binding. Each request is handled on its own task.
async fn listen(worker: Arc<Worker>, mut subscription: Subscription, stop: CancellationToken) {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            message = subscription.next() => match message {
                Some(message) => {
                    let worker = worker.clone();
                    in_flight.spawn(async move { answer(&worker, message).await });
                }
                None => break,
            },
        }
    }

    if let Err(e) = subscription.close() {
        error!(channel = %subscription.channel(), error = %e, "Failed to close request subscription");
    }
    while in_flight.join_next().await.is_some() {}
}

/// Decode one request and publish exactly one response to it.
async fn answer(worker: &Worker, message: Bytes) {
    let request = match RequestEnvelope::decode(message) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Dropping undecodable request");
            return;
        }
    };
    if request.correlation_id.is_empty() {
        warn!(sender_id = %request.sender_id, "Dropping request without correlation id");
        return;
    }

    let span = tracing::info_span!(
        "rpc.handle",
        correlation_id = %request.correlation_id,
        sender_id = %request.sender_id,
        target_id = %request.target_id,
    );

    async {
        let result = handle(worker, &request).await;
        if let Err(e) = &result {
            debug!(error = %e, "Handler returned error");
        }
        if let Err(e) = publish_response(worker.bus.as_ref(), &request.correlation_id, result).await {
            error!(error = %e, "Failed to publish response");
        }
    }
    .instrument(span)
    .await
}

async fn handle(worker: &Worker, request: &RequestEnvelope) -> HandlerResult {
    if let (Some(limit), Some(age)) = (worker.expiration, request.age(now_nanos())) {
        if age > limit {
            warn!(age = ?age, limit = ?limit, "Request expired before handling");
            return Err(HandlerError::Expired);
        }
    }

    let Some(handler) = worker.handler() else {
        return Err(HandlerError::failed("no handler bound"));
    };

    let ctx = RequestContext::from(request);
    match AssertUnwindSafe(handler.handle(ctx, request.payload.clone()))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(_) => {
            error!("Handler panicked");
            Err(HandlerError::failed("handler panicked"))
        }
    }
}

async fn publish_response(
    bus: &dyn MessageBus,
    correlation_id: &str,
    result: HandlerResult,
) -> crate::bus::Result<()> {
    let response = match result {
        Ok(payload) => ResponseEnvelope::success(correlation_id, payload),
        Err(e) => ResponseEnvelope::failure(correlation_id, e.to_string()),
    };
    bus.publish(&response_channel(correlation_id), encode(&response))
        .await?;
    debug!(correlation_id = %correlation_id, "Response published");
    Ok(())
}
