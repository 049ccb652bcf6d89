//! Configuration-driven wiring.

use std::io::Write;
use std::time::Duration;

use ingress_rpc::config::Config;
use ingress_rpc::rpc::{Responder, RpcClient};
use ingress_rpc::test_utils::{Ping, Pong, TaggedHandler};
use serial_test::serial;

#[tokio::test]
#[serial]
async fn test_client_and_responder_from_config_file() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(
        file,
        r#"
node_id: "ND_configured"
rpc:
  request_timeout_ms: 500
  request_expiration_ms: 0
  entity_group: "edge"
messaging:
  type: channel
  channel:
    capacity: 64
"#
    )
    .unwrap();

    let config = Config::load(Some(file.path().to_str().unwrap())).unwrap();
    let bus = ingress_rpc::init_message_bus(&config.messaging).await.unwrap();

    let responder = Responder::from_config(config.node_id(), &config.rpc, bus.clone()).entity_lookup();
    responder.set_handler(TaggedHandler::new("edge")).await.unwrap();
    let client = RpcClient::from_config(config.node_id(), &config.rpc, bus.clone());

    assert_eq!(client.node_id().as_str(), "ND_configured");
    assert_eq!(client.timeout(), Duration::from_millis(500));

    let pong: Pong = client.send_entity_request(&Ping::default()).await.unwrap();
    assert_eq!(pong.message, "edge");

    responder.shutdown().await;
    bus.close().await.unwrap();
}
