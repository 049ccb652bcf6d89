//! Broadcast notifications.

use std::time::Duration;

use ingress_rpc::notifier::{Notifier, UpdateObserver};
use ingress_rpc::test_utils::{Ping, Pong};

use crate::common::bus;

async fn next_update(observer: &mut UpdateObserver) -> Option<String> {
    let update = tokio::time::timeout(Duration::from_millis(100), observer.next())
        .await
        .ok()
        .flatten()?;
    let state: Pong = update.state?.to_msg().ok()?;
    Some(format!("{}={}", update.subject_id, state.message))
}

fn state(message: &str) -> Pong {
    Pong {
        message: message.to_string(),
    }
}

#[tokio::test]
async fn test_every_current_observer_sees_update() {
    let bus = bus();
    let notifier = Notifier::new(bus.clone());
    let mut first = notifier.update_subscription().await.unwrap();
    let mut second = notifier.update_subscription().await.unwrap();
    let mut gone = notifier.update_subscription().await.unwrap();
    gone.close().unwrap();

    notifier
        .notify_message("entity-42", &state("ENDPOINT_PUBLISHING"))
        .await
        .unwrap();

    let expected = Some("entity-42=ENDPOINT_PUBLISHING".to_string());
    assert_eq!(next_update(&mut first).await, expected);
    assert_eq!(next_update(&mut second).await, expected);
    assert_eq!(next_update(&mut gone).await, None);
}

#[tokio::test]
async fn test_late_observer_misses_earlier_updates() {
    let bus = bus();
    let notifier = Notifier::new(bus.clone());

    notifier.notify_message("entity-1", &state("early")).await.unwrap();
    let mut late = notifier.update_subscription().await.unwrap();
    notifier.notify_message("entity-1", &state("late")).await.unwrap();

    assert_eq!(next_update(&mut late).await, Some("entity-1=late".to_string()));
    assert_eq!(next_update(&mut late).await, None);
}

#[tokio::test]
async fn test_queue_observers_share_updates() {
    let bus = bus();
    let notifier = Notifier::new(bus.clone());
    let mut a = notifier.update_queue_subscription("audit").await.unwrap();
    let mut b = notifier.update_queue_subscription("audit").await.unwrap();
    let mut everyone = notifier.update_subscription().await.unwrap();

    for i in 0..4 {
        notifier
            .notify_message(&format!("entity-{}", i), &state("ok"))
            .await
            .unwrap();
    }

    let mut grouped = 0;
    while next_update(&mut a).await.is_some() {
        grouped += 1;
    }
    while next_update(&mut b).await.is_some() {
        grouped += 1;
    }
    let mut broadcast = 0;
    while next_update(&mut everyone).await.is_some() {
        broadcast += 1;
    }

    assert_eq!(grouped, 4);
    assert_eq!(broadcast, 4);
}

#[tokio::test]
async fn test_non_state_payload_is_still_delivered() {
    let bus = bus();
    let notifier = Notifier::new(bus.clone());
    let mut observer = notifier.update_subscription().await.unwrap();

    notifier
        .notify_message("entity-7", &Ping::default())
        .await
        .unwrap();

    let update = observer.next().await.unwrap();
    assert_eq!(update.subject_id, "entity-7");
    assert!(update.state.unwrap().to_msg::<Pong>().is_err());
}
