use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use weave_core::{
    BusConfig, ConnectionState, DisconnectedPolicy, LocalHub, MeshError, Message, MessageBus,
    OverflowPolicy, RetryPolicy, Transport, TransportConfig,
};

fn fail_fast() -> TransportConfig {
    TransportConfig {
        when_disconnected: DisconnectedPolicy::FailFast,
        ..TransportConfig::default()
    }
}

fn queueing(capacity: usize, overflow: OverflowPolicy) -> TransportConfig {
    TransportConfig {
        when_disconnected: DisconnectedPolicy::Queue { capacity, overflow },
        ..TransportConfig::default()
    }
}

async fn next_payload(rx: &mut mpsc::Receiver<weave_core::Inbound>) -> Value {
    let inbound = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timeout")
        .expect("channel closed");
    inbound.raw["payload"].clone()
}

#[tokio::test]
async fn delivers_raw_json_to_the_target_inbox() {
    let hub = LocalHub::new(TransportConfig::default());
    let a = hub.attach("a").unwrap();
    let b = hub.attach("b").unwrap();
    let mut inbox = b.take_inbound().unwrap();
    assert!(b.take_inbound().is_none());

    a.send(&Message::request("a", "b", json!({ "x": 1 })))
        .await
        .unwrap();
    let inbound = inbox.recv().await.unwrap();
    assert_eq!(inbound.raw["type"], "request");
    assert_eq!(inbound.raw["payload"], json!({ "x": 1 }));
    assert!(inbound.identity.is_none());
}

#[tokio::test]
async fn unknown_target_is_a_transport_error() {
    let hub = LocalHub::new(TransportConfig::default());
    let a = hub.attach("a").unwrap();
    let err = a
        .send(&Message::request("a", "ghost", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Transport(_)));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn names_are_unique_until_detached() {
    let hub = LocalHub::new(TransportConfig::default());
    let first = hub.attach("a").unwrap();
    assert!(matches!(hub.attach("a"), Err(MeshError::Config(_))));

    drop(first);
    let second = hub.attach("a").unwrap();
    assert_eq!(hub.endpoints(), vec!["a".to_string()]);

    second.close().await;
    assert!(hub.endpoints().is_empty());
}

#[tokio::test]
async fn fail_fast_rejects_sends_while_disconnected() {
    let hub = LocalHub::new(fail_fast());
    let a = hub.attach("a").unwrap();
    let _b = hub.attach("b").unwrap();

    a.disconnect();
    assert_eq!(a.state(), ConnectionState::Disconnected);
    let err = a
        .send(&Message::request("a", "b", json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, MeshError::Transport(_)));
    assert_eq!(a.queued(), 0);
}

#[tokio::test]
async fn queued_messages_flush_in_order_on_reconnect() {
    let hub = LocalHub::new(TransportConfig::default());
    let a = hub.attach("a").unwrap();
    let b = hub.attach("b").unwrap();
    let mut inbox = b.take_inbound().unwrap();
    let mut states = a.watch_state();

    a.disconnect();
    for i in 0..5 {
        a.send(&Message::request("a", "b", json!(i))).await.unwrap();
    }
    assert_eq!(a.queued(), 5);
    assert!(inbox.try_recv().is_err());

    a.reconnect().await.unwrap();
    assert_eq!(a.queued(), 0);
    for i in 0..5 {
        assert_eq!(next_payload(&mut inbox).await, json!(i));
    }
    assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);
}

#[tokio::test]
async fn sends_during_a_blocked_flush_are_not_stranded() {
    let hub = LocalHub::new(TransportConfig {
        inbox_capacity: 1,
        ..TransportConfig::default()
    });
    let a = Arc::new(hub.attach("a").unwrap());
    let b = hub.attach("b").unwrap();
    let mut inbox = b.take_inbound().unwrap();

    a.disconnect();
    for i in 1..=2 {
        a.send(&Message::request("a", "b", json!(i))).await.unwrap();
    }

    // The second queued message blocks on b's full inbox mid-flush.
    let flushing = {
        let a = Arc::clone(&a);
        tokio::spawn(async move { a.reconnect().await })
    };
    while a.state() != ConnectionState::Reconnecting || a.queued() != 0 {
        tokio::task::yield_now().await;
    }
    a.send(&Message::request("a", "b", json!(3))).await.unwrap();

    for i in 1..=3 {
        assert_eq!(next_payload(&mut inbox).await, json!(i));
    }
    flushing.await.unwrap().unwrap();
    assert_eq!(a.state(), ConnectionState::Connected);
    assert_eq!(a.queued(), 0);
}

#[tokio::test]
async fn drop_oldest_keeps_the_latest_backlog() {
    let hub = LocalHub::new(queueing(2, OverflowPolicy::DropOldest));
    let a = hub.attach("a").unwrap();
    let b = hub.attach("b").unwrap();
    let mut inbox = b.take_inbound().unwrap();

    a.disconnect();
    for i in 0..4 {
        a.send(&Message::request("a", "b", json!(i))).await.unwrap();
    }
    a.reconnect().await.unwrap();
    assert_eq!(next_payload(&mut inbox).await, json!(2));
    assert_eq!(next_payload(&mut inbox).await, json!(3));
}

#[tokio::test]
async fn reject_new_surfaces_queue_full() {
    let hub = LocalHub::new(queueing(1, OverflowPolicy::RejectNew));
    let a = hub.attach("a").unwrap();
    a.disconnect();
    a.send(&Message::broadcast("a", json!(1))).await.unwrap();
    assert_eq!(
        a.send(&Message::broadcast("a", json!(2))).await,
        Err(MeshError::QueueFull)
    );
}

#[tokio::test]
async fn disconnected_receivers_are_skipped_by_broadcast() {
    let hub = LocalHub::new(TransportConfig::default());
    let a = hub.attach("a").unwrap();
    let b = hub.attach("b").unwrap();
    let c = hub.attach("c").unwrap();
    let mut a_inbox = a.take_inbound().unwrap();
    let mut b_inbox = b.take_inbound().unwrap();
    let mut c_inbox = c.take_inbound().unwrap();

    c.disconnect();
    a.send(&Message::broadcast("a", json!("hi"))).await.unwrap();

    assert_eq!(next_payload(&mut b_inbox).await, json!("hi"));
    assert!(a_inbox.try_recv().is_err());
    assert!(c_inbox.try_recv().is_err());
}

#[tokio::test]
async fn bus_requests_survive_a_short_disconnect() {
    let hub = LocalHub::new(TransportConfig::default());
    let config = BusConfig {
        retry: RetryPolicy::no_retry(),
        ..BusConfig::default()
    };
    let a_transport = Arc::new(hub.attach("a").unwrap());
    let a = MessageBus::builder("a", a_transport.clone())
        .config(config.clone())
        .build()
        .unwrap();
    let b = MessageBus::builder("b", Arc::new(hub.attach("b").unwrap()))
        .config(config)
        .build()
        .unwrap();
    b.register_handler(
        "ping",
        weave_core::handler_fn(|_ctx, _payload| async move {
            Ok::<_, MeshError>(json!("pong"))
        }),
    );

    a_transport.disconnect();
    let call = {
        let a = a.clone();
        tokio::spawn(async move {
            a.request("b", json!({ "op": "ping" }), Duration::from_secs(5))
                .await
        })
    };
    while a_transport.queued() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    a_transport.reconnect().await.unwrap();
    assert_eq!(call.await.unwrap(), Ok(json!("pong")));
}
