//! Client call semantics against live responders.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ingress_rpc::bus::{ChannelMessageBus, MessageBus};
use ingress_rpc::channels::{request_channel, response_channel};
use ingress_rpc::envelope::{encode, RequestEnvelope, ResponseEnvelope};
use ingress_rpc::rpc::{HandlerError, RequestContext, RpcError};
use ingress_rpc::test_utils::{
    ping_any, Ack, Command, EchoHandler, FailingHandler, Ping, Pong, TaggedHandler,
};
use ingress_rpc::Dispatcher;
use prost::Message;
use tokio_util::sync::CancellationToken;

use crate::common::{bus, client, client_with_id, serve_entity, serve_lookup, TEST_TIMEOUT};

fn start_dispatcher() -> Dispatcher {
    Dispatcher::new().route_message(|_ctx: RequestContext, command: Command| async move {
        match command.op.as_str() {
            "start" => Ok(Ack { ok: true }),
            other => Err(HandlerError::failed(format!("unknown op {}", other))),
        }
    })
}

#[tokio::test]
async fn test_start_entity_42_succeeds() {
    let bus = bus();
    let _server = serve_entity(&bus, "entity-42", start_dispatcher()).await;

    let ack: Ack = client(&bus, "ND_caller")
        .send_request(
            "entity-42",
            &Command {
                op: "start".to_string(),
            },
        )
        .await
        .unwrap();

    assert!(ack.ok);
}

#[tokio::test]
async fn test_call_without_server_times_out() {
    let bus = bus();

    let started = tokio::time::Instant::now();
    let err = client(&bus, "ND_caller")
        .send_request::<Command, Ack>(
            "entity-99",
            &Command {
                op: "start".to_string(),
            },
        )
        .await
        .unwrap_err();

    assert!(err.is_timeout(), "{:?}", err);
    assert!(started.elapsed() >= TEST_TIMEOUT);
}

#[tokio::test]
async fn test_handler_error_text_is_surfaced() {
    let bus = bus();
    let _server = serve_entity(&bus, "entity-42", FailingHandler::new("ingress not found")).await;

    let err = client(&bus, "ND_caller")
        .call("entity-42", ping_any("x"))
        .await
        .unwrap_err();

    assert!(matches!(err, RpcError::Application(ref text) if text == "ingress not found"));
}

#[tokio::test]
async fn test_unknown_op_is_application_error() {
    let bus = bus();
    let _server = serve_entity(&bus, "entity-42", start_dispatcher()).await;

    let err = client(&bus, "ND_caller")
        .send_request::<Command, Ack>(
            "entity-42",
            &Command {
                op: "explode".to_string(),
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err.application_message(), Some("unknown op explode"));
}

#[tokio::test]
async fn test_concurrent_calls_receive_only_their_own_response() {
    let bus = bus();
    let _server = serve_entity(&bus, "entity-42", EchoHandler).await;
    let client = client(&bus, "ND_caller").with_timeout(Duration::from_secs(2));

    let calls = (0..50).map(|i| {
        let client = client.clone();
        tokio::spawn(async move {
            let message = format!("msg-{}", i);
            let payload = client.call("entity-42", ping_any(&message)).await?;
            let ping: Ping = payload
                .ok_or(RpcError::MissingPayload)?
                .to_msg()
                .map_err(|source| RpcError::Decode {
                    what: "ping",
                    source,
                })?;
            Ok::<_, RpcError>((message, ping.message))
        })
    });

    for call in futures::future::join_all(calls).await {
        let (sent, received) = call.unwrap().unwrap();
        assert_eq!(sent, received);
    }
}

#[tokio::test]
async fn test_entity_lookup_is_answered_once() {
    let bus = bus();
    let _a = serve_lookup(&bus, TaggedHandler::new("a")).await;
    let _b = serve_lookup(&bus, TaggedHandler::new("b")).await;
    let client = client_with_id(&bus, "RPC_lookup");

    // Watch the response channel alongside the caller.
    let mut watcher = bus.subscribe(&response_channel("RPC_lookup")).await.unwrap();

    let pong: Pong = client.send_entity_request(&Ping::default()).await.unwrap();
    assert!(pong.message == "a" || pong.message == "b");

    assert!(watcher.next().await.is_some());
    let second = tokio::time::timeout(Duration::from_millis(100), watcher.next()).await;
    assert!(second.is_err(), "entity lookup answered more than once");
}

/// Answers every request on `entity_id` with `responses`, bypassing `Responder`.
async fn rogue_responder(
    bus: &Arc<ChannelMessageBus>,
    entity_id: &str,
    responses: fn(&RequestEnvelope) -> Vec<Bytes>,
) {
    let mut requests = bus.subscribe(&request_channel(entity_id)).await.unwrap();
    let bus = bus.clone();
    tokio::spawn(async move {
        while let Some(message) = requests.next().await {
            let request = RequestEnvelope::decode(message).unwrap();
            for response in responses(&request) {
                bus.publish(&response_channel(&request.correlation_id), response)
                    .await
                    .unwrap();
            }
        }
    });
}

#[tokio::test]
async fn test_first_response_wins() {
    let bus = bus();
    rogue_responder(&bus, "entity-dup", |request| {
        vec![
            encode(&ResponseEnvelope::success(
                request.correlation_id.clone(),
                Some(ping_any("first")),
            )),
            encode(&ResponseEnvelope::failure(
                request.correlation_id.clone(),
                "second",
            )),
        ]
    })
    .await;

    let payload = client(&bus, "ND_caller")
        .call("entity-dup", ping_any("x"))
        .await
        .unwrap();

    let ping: Ping = payload.unwrap().to_msg().unwrap();
    assert_eq!(ping.message, "first");
}

#[tokio::test]
async fn test_response_subscription_closed_after_every_outcome() {
    let bus = bus();
    let _ok = serve_entity(&bus, "entity-ok", EchoHandler).await;
    rogue_responder(&bus, "entity-garbage", |_| {
        vec![Bytes::from_static(&[0x0a, 0xff, 0x01])]
    })
    .await;

    let success = client_with_id(&bus, "RPC_success");
    assert!(success.call("entity-ok", ping_any("x")).await.is_ok());
    assert_eq!(bus.subscriber_count(&response_channel("RPC_success")), 0);

    let garbage = client_with_id(&bus, "RPC_garbage");
    let err = garbage.call("entity-garbage", ping_any("x")).await.unwrap_err();
    assert!(matches!(err, RpcError::Decode { .. }));
    assert_eq!(bus.subscriber_count(&response_channel("RPC_garbage")), 0);

    let timeout = client_with_id(&bus, "RPC_timeout");
    assert!(timeout
        .call("entity-none", ping_any("x"))
        .await
        .unwrap_err()
        .is_timeout());
    assert_eq!(bus.subscriber_count(&response_channel("RPC_timeout")), 0);

    let cancelled = client_with_id(&bus, "RPC_cancelled").with_timeout(Duration::from_secs(30));
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let err = cancelled
        .call_with_cancel("entity-none", ping_any("x"), &token)
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Cancelled));
    assert_eq!(bus.subscriber_count(&response_channel("RPC_cancelled")), 0);
}

#[tokio::test]
async fn test_correlation_ids_are_unique_per_call() {
    let bus = bus();
    let mut requests = bus.subscribe(&request_channel("entity-ids")).await.unwrap();
    let client = client(&bus, "ND_caller").with_timeout(Duration::from_millis(20));

    for _ in 0..5 {
        let _ = client.call("entity-ids", ping_any("x")).await;
    }

    let mut ids = HashSet::new();
    for _ in 0..5 {
        let request = RequestEnvelope::decode(requests.next().await.unwrap()).unwrap();
        assert!(request.correlation_id.starts_with("RPC_"));
        assert_eq!(request.sender_id, "ND_caller");
        ids.insert(request.correlation_id);
    }
    assert_eq!(ids.len(), 5);
}
