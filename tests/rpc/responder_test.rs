//! Responder lifecycle and delivery modes.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use ingress_rpc::channels::{request_channel, ENTITY_CHANNEL};
use ingress_rpc::identity::NodeId;
use ingress_rpc::rpc::{Responder, RpcError};
use ingress_rpc::test_utils::{ping_any, EchoHandler, Ping, Pong, SlowHandler, TaggedHandler};

use crate::common::{bus, client, serve_entity, serve_lookup};

async fn wait_for(counter: &std::sync::atomic::AtomicUsize, value: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while counter.load(Ordering::SeqCst) < value {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("counter never reached expected value");
}

#[tokio::test]
async fn test_queue_group_spreads_load_across_instances() {
    let bus = bus();
    let _a = serve_lookup(&bus, TaggedHandler::new("a")).await;
    let _b = serve_lookup(&bus, TaggedHandler::new("b")).await;
    let _c = serve_lookup(&bus, TaggedHandler::new("c")).await;
    let client = client(&bus, "ND_caller");

    let mut handled: HashMap<String, usize> = HashMap::new();
    for _ in 0..30 {
        let pong: Pong = client.send_entity_request(&Ping::default()).await.unwrap();
        *handled.entry(pong.message).or_default() += 1;
    }

    assert_eq!(handled.values().sum::<usize>(), 30);
    for tag in ["a", "b", "c"] {
        assert!(handled.get(tag).copied().unwrap_or(0) > 0, "{:?}", handled);
    }
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_requests_finish() {
    let bus = bus();
    let handler = SlowHandler::new(Duration::from_millis(100));
    let (started, completed) = (handler.started(), handler.completed());
    let server = serve_entity(&bus, "entity-42", handler).await;
    let client = client(&bus, "ND_caller").with_timeout(Duration::from_secs(2));

    let call = tokio::spawn(async move { client.call("entity-42", ping_any("slow")).await });
    wait_for(&started, 1).await;

    server.shutdown().await;

    assert_eq!(completed.load(Ordering::SeqCst), 1);
    assert!(call.await.unwrap().is_ok());
    assert_eq!(bus.subscriber_count(&request_channel("entity-42")), 0);
}

#[tokio::test]
async fn test_kill_aborts_in_flight_requests() {
    let bus = bus();
    let handler = SlowHandler::new(Duration::from_millis(200));
    let (started, completed) = (handler.started(), handler.completed());
    let server = serve_entity(&bus, "entity-42", handler).await;
    let client = client(&bus, "ND_caller");

    let call = tokio::spawn(async move { client.call("entity-42", ping_any("slow")).await });
    wait_for(&started, 1).await;

    server.kill().await;

    let err = call.await.unwrap().unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(completed.load(Ordering::SeqCst), 0);
    assert_eq!(bus.subscriber_count(&request_channel("entity-42")), 0);
}

#[tokio::test]
async fn test_removed_entity_stops_answering() {
    let bus = bus();
    let server = serve_entity(&bus, "entity-42", EchoHandler).await;
    server.add_entity("entity-43").await.unwrap();
    let client = client(&bus, "ND_caller");

    assert!(client.call("entity-43", ping_any("x")).await.is_ok());

    server.remove_entity("entity-43").await;

    let err = client.call("entity-43", ping_any("x")).await.unwrap_err();
    assert!(matches!(err, RpcError::NoResponse));
    assert!(client.call("entity-42", ping_any("x")).await.is_ok());
}

#[tokio::test]
async fn test_entity_and_lookup_bindings_on_one_responder() {
    let bus = bus();
    let server = Responder::new(NodeId::from("ND_server"), bus.clone())
        .entity("entity-42")
        .entity_lookup();
    server.set_handler(TaggedHandler::new("server")).await.unwrap();
    let client = client(&bus, "ND_caller");

    let targeted: Pong = client
        .send_request("entity-42", &Ping::default())
        .await
        .unwrap();
    let lookup: Pong = client.send_entity_request(&Ping::default()).await.unwrap();

    assert_eq!(targeted.message, "server");
    assert_eq!(lookup.message, "server");
    assert_eq!(bus.subscriber_count(ENTITY_CHANNEL), 1);

    server.shutdown().await;
    assert_eq!(bus.subscriber_count(ENTITY_CHANNEL), 0);
}

#[tokio::test]
async fn test_handler_swap_applies_to_next_request() {
    let bus = bus();
    let server = serve_entity(&bus, "entity-42", TaggedHandler::new("v1")).await;
    let client = client(&bus, "ND_caller");

    let before: Pong = client.send_request("entity-42", &Ping::default()).await.unwrap();
    server.set_handler(TaggedHandler::new("v2")).await.unwrap();
    let after: Pong = client.send_request("entity-42", &Ping::default()).await.unwrap();

    assert_eq!(before.message, "v1");
    assert_eq!(after.message, "v2");
    assert_eq!(bus.subscriber_count(&request_channel("entity-42")), 1);
}
