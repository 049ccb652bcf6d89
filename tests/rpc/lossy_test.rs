//! Lost requests and lost responses both surface as timeouts.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use ingress_rpc::bus::{ChannelMessageBus, LossyConfig, LossyMessageBus};
use ingress_rpc::identity::NodeId;
use ingress_rpc::rpc::{Responder, RpcClient};
use ingress_rpc::test_utils::{ping_any, SlowHandler};

use crate::common::TEST_TIMEOUT;

/// Client and responder on one lossy bus; returns the handler's start counter.
async fn lossy_pair(
    config: LossyConfig,
) -> (
    Arc<LossyMessageBus<ChannelMessageBus>>,
    RpcClient,
    Responder,
    Arc<std::sync::atomic::AtomicUsize>,
) {
    let bus = Arc::new(LossyMessageBus::new(ChannelMessageBus::new(), config));
    let handler = SlowHandler::new(Duration::ZERO);
    let started = handler.started();
    let responder = Responder::new(NodeId::from("ND_server"), bus.clone()).entity("entity-42");
    responder.set_handler(handler).await.unwrap();
    let client = RpcClient::new(NodeId::from("ND_caller"), bus.clone()).with_timeout(TEST_TIMEOUT);
    (bus, client, responder, started)
}

#[tokio::test]
async fn test_lost_request_never_reaches_handler() {
    let (bus, client, _responder, started) =
        lossy_pair(LossyConfig::default().drop_requests(1.0)).await;

    let err = client.call("entity-42", ping_any("lost")).await.unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(started.load(Ordering::SeqCst), 0);
    assert_eq!(bus.stats().requests_dropped(), 1);
    assert_eq!(bus.stats().responses_dropped(), 0);
}

#[tokio::test]
async fn test_lost_response_times_out_after_handler_ran() {
    let (bus, client, _responder, started) =
        lossy_pair(LossyConfig::default().drop_responses(1.0)).await;

    let err = client.call("entity-42", ping_any("unanswered")).await.unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(bus.stats().requests_dropped(), 0);
    assert_eq!(bus.stats().responses_dropped(), 1);
}

#[tokio::test]
async fn test_lossless_config_delivers() {
    let (bus, client, _responder, _) = lossy_pair(LossyConfig::default()).await;

    assert!(client.call("entity-42", ping_any("kept")).await.is_ok());
    assert_eq!(bus.stats().requests_dropped(), 0);
    assert_eq!(bus.stats().responses_dropped(), 0);
}
