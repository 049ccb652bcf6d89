//! Request handler seam.
//!
//! A responder invokes one [`RequestHandler`] per decoded request. Services
//! exposing several request kinds compose typed handlers in a
//! [`Dispatcher`], keyed on the protobuf type URL of the request payload.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use prost_types::Any;
use tracing::debug;

use crate::envelope::RequestEnvelope;

/// Result of handling one request: an optional response payload.
pub type HandlerResult = std::result::Result<Option<Any>, HandlerError>;

/// Errors a handler can report. Rendered as text into the response.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error("no handler registered for {0}")]
    Unimplemented(String),

    #[error("request carried no payload")]
    MissingPayload,

    #[error("request expired")]
    Expired,

    #[error("invalid request payload: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("failed to encode response: {0}")]
    Encode(#[from] prost::EncodeError),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Correlation metadata of the request being handled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub correlation_id: String,
    pub sender_id: String,
    /// Empty for un-targeted (entity lookup) requests.
    pub target_id: String,
    pub sent_at: i64,
}

impl From<&RequestEnvelope> for RequestContext {
    fn from(request: &RequestEnvelope) -> Self {
        Self {
            correlation_id: request.correlation_id.clone(),
            sender_id: request.sender_id.clone(),
            target_id: request.target_id.clone(),
            sent_at: request.sent_at,
        }
    }
}

/// Business logic bound to a responder.
///
/// Handlers must not block indefinitely; the responder enforces no timeout.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, ctx: RequestContext, payload: Option<Any>) -> HandlerResult;
}

#[async_trait]
impl<H: RequestHandler + ?Sized> RequestHandler for Arc<H> {
    async fn handle(&self, ctx: RequestContext, payload: Option<Any>) -> HandlerResult {
        (**self).handle(ctx, payload).await
    }
}

/// Adapts an async closure over typed prost messages into a handler.
struct TypedHandler<Req, Resp, F> {
    handler: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

#[async_trait]
impl<Req, Resp, F, Fut> RequestHandler for TypedHandler<Req, Resp, F>
where
    Req: prost::Name + Default + Send + 'static,
    Resp: prost::Name + Send + 'static,
    F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Resp, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: RequestContext, payload: Option<Any>) -> HandlerResult {
        let request: Req = payload.ok_or(HandlerError::MissingPayload)?.to_msg()?;
        let response = (self.handler)(ctx, request).await?;
        Ok(Some(Any::from_msg(&response)?))
    }
}

/// Fully qualified message name of a type URL, ignoring any host prefix.
fn message_name(type_url: &str) -> &str {
    type_url.rsplit('/').next().unwrap_or(type_url)
}

/// Dispatch table from payload message name to handler.
///
/// Type URLs match on the message name after the last `/`, so
/// `type.googleapis.com/pkg.Msg` and `/pkg.Msg` route the same way.
#[derive(Default)]
pub struct Dispatcher {
    routes: HashMap<String, Arc<dyn RequestHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route payloads with `type_url` to `handler`.
    pub fn route(mut self, type_url: impl Into<String>, handler: impl RequestHandler + 'static) -> Self {
        let type_url = type_url.into();
        self.routes
            .insert(message_name(&type_url).to_string(), Arc::new(handler));
        self
    }

    /// Route payloads of message type `Req` to an async function returning `Resp`.
    pub fn route_message<Req, Resp, F, Fut>(self, handler: F) -> Self
    where
        Req: prost::Name + Default + Send + 'static,
        Resp: prost::Name + Send + 'static,
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Resp, HandlerError>> + Send + 'static,
    {
        let typed = TypedHandler {
            handler,
            _types: PhantomData,
        };
        self.route(Req::type_url(), typed)
    }

    /// Registered message names.
    pub fn message_names(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, ctx: RequestContext, payload: Option<Any>) -> HandlerResult {
        let type_url = payload
            .as_ref()
            .map(|p| p.type_url.clone())
            .ok_or(HandlerError::MissingPayload)?;

        let handler = self
            .routes
            .get(message_name(&type_url))
            .ok_or_else(|| HandlerError::Unimplemented(type_url.clone()))?;

        debug!(
            correlation_id = %ctx.correlation_id,
            type_url = %type_url,
            "Dispatching request"
        );

        handler.handle(ctx, payload).await
    }
}
