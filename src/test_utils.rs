//! Test utilities: sample payloads and canned handlers.
//!
//! Used by unit tests and, behind the `test-utils` feature, by the
//! integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use prost_types::Any;

use crate::envelope::{encode, now_nanos, RequestEnvelope};
use crate::identity::CorrelationIdGenerator;
use crate::rpc::{HandlerError, HandlerResult, RequestContext, RequestHandler};

const TEST_PACKAGE: &str = "ingress_rpc.test";

/// Sample request payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
    #[prost(string, tag = "1")]
    pub message: String,
}

impl prost::Name for Ping {
    const NAME: &'static str = "Ping";
    const PACKAGE: &'static str = TEST_PACKAGE;
}

/// Sample response payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
    #[prost(string, tag = "1")]
    pub message: String,
}

impl prost::Name for Pong {
    const NAME: &'static str = "Pong";
    const PACKAGE: &'static str = TEST_PACKAGE;
}

/// Entity command, e.g. `{op: "start"}`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Command {
    #[prost(string, tag = "1")]
    pub op: String,
}

impl prost::Name for Command {
    const NAME: &'static str = "Command";
    const PACKAGE: &'static str = TEST_PACKAGE;
}

/// Command acknowledgement, e.g. `{ok: true}`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ack {
    #[prost(bool, tag = "1")]
    pub ok: bool,
}

impl prost::Name for Ack {
    const NAME: &'static str = "Ack";
    const PACKAGE: &'static str = TEST_PACKAGE;
}

/// `Ping { message }` wrapped in `Any`.
pub fn ping_any(message: &str) -> Any {
    Any {
        type_url: <Ping as prost::Name>::type_url(),
        value: prost::Message::encode_to_vec(&Ping {
            message: message.to_string(),
        }),
    }
}

/// Encoded request envelope carrying `ping_any(message)`, sent now.
pub fn request_bytes(correlation_id: &str, target_id: &str, message: &str) -> Bytes {
    encode(&RequestEnvelope {
        correlation_id: correlation_id.to_string(),
        sender_id: "ND_test".to_string(),
        target_id: target_id.to_string(),
        sent_at: now_nanos(),
        payload: Some(ping_any(message)),
    })
}

/// Hands out the same correlation id every time.
pub struct FixedIdGenerator {
    id: String,
}

impl FixedIdGenerator {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl CorrelationIdGenerator for FixedIdGenerator {
    fn next_id(&self) -> String {
        self.id.clone()
    }
}

/// Returns the request payload unchanged.
pub struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, _ctx: RequestContext, payload: Option<Any>) -> HandlerResult {
        Ok(payload)
    }
}

/// Always fails with a fixed message.
pub struct FailingHandler {
    message: String,
}

impl FailingHandler {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl RequestHandler for FailingHandler {
    async fn handle(&self, _ctx: RequestContext, _payload: Option<Any>) -> HandlerResult {
        Err(HandlerError::failed(self.message.clone()))
    }
}

/// Panics on every request.
pub struct PanickingHandler;

#[async_trait]
impl RequestHandler for PanickingHandler {
    async fn handle(&self, _ctx: RequestContext, _payload: Option<Any>) -> HandlerResult {
        panic!("handler bug")
    }
}

/// Answers `Pong { message: tag }`, identifying which instance handled a request.
pub struct TaggedHandler {
    tag: String,
}

impl TaggedHandler {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

#[async_trait]
impl RequestHandler for TaggedHandler {
    async fn handle(&self, _ctx: RequestContext, _payload: Option<Any>) -> HandlerResult {
        let pong = Pong {
            message: self.tag.clone(),
        };
        Ok(Some(Any::from_msg(&pong)?))
    }
}

/// Echoes after a delay and counts started and finished requests.
pub struct SlowHandler {
    delay: Duration,
    started: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            started: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of requests that entered the handler.
    pub fn started(&self) -> Arc<AtomicUsize> {
        self.started.clone()
    }

    /// Counter of requests that ran to completion.
    pub fn completed(&self) -> Arc<AtomicUsize> {
        self.completed.clone()
    }
}

#[async_trait]
impl RequestHandler for SlowHandler {
    async fn handle(&self, _ctx: RequestContext, payload: Option<Any>) -> HandlerResult {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(payload)
    }
}
