use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::json;
use weave_core::router::{Dispatch, MessageHandler};
use weave_core::{Message, MessageRouter, MessageType, MessageValidator, RouteKind};

// Records which handler saw which message id
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(RouteKind, String)>>,
}

impl Recorder {
    fn handler(self: &Arc<Self>, kind: RouteKind) -> Arc<dyn MessageHandler> {
        let rec = Arc::clone(self);
        Arc::new(move |msg: Message| -> Dispatch {
            rec.seen.lock().push((kind, msg.message_id));
            None
        })
    }

    fn seen(&self) -> Vec<(RouteKind, String)> {
        self.seen.lock().clone()
    }
}

fn router() -> MessageRouter {
    MessageRouter::new(Arc::new(MessageValidator::default()))
}

fn message(kind: MessageType) -> Message {
    let mut msg = Message::new(kind, "a", "b", json!({}));
    if kind.is_stream() {
        msg.stream_id = Some("s-1".into());
    }
    if kind == MessageType::Response {
        msg.correlation_id = Some("m-0".into());
    }
    if kind == MessageType::StreamError {
        msg.error = Some(weave_core::ErrorInfo::new("Boom", "failed"));
    }
    msg
}

#[tokio::test]
async fn each_type_reaches_exactly_its_handler() {
    let r = router();
    let rec = Arc::new(Recorder::default());
    for kind in MessageType::ALL {
        r.register(kind.into(), rec.handler(kind.into()));
    }

    for kind in MessageType::ALL {
        let msg = message(kind);
        let id = msg.message_id.clone();
        assert!(r.route(msg));
        assert_eq!(rec.seen().last(), Some(&(RouteKind::from(kind), id)));
    }
    assert_eq!(rec.seen().len(), 7);
    assert_eq!(r.stats().delivered, 7);
}

#[tokio::test]
async fn missing_handler_returns_false_and_uses_fallback() {
    let r = router();
    assert!(!r.route(message(MessageType::Broadcast)));

    let rec = Arc::new(Recorder::default());
    r.register(RouteKind::Unknown, rec.handler(RouteKind::Unknown));
    let msg = message(MessageType::Broadcast);
    let id = msg.message_id.clone();
    assert!(!r.route(msg));
    assert_eq!(rec.seen(), vec![(RouteKind::Unknown, id)]);
    assert_eq!(r.stats().unroutable, 2);
}

#[tokio::test]
async fn invalid_raw_input_never_reaches_a_handler() {
    let r = router();
    let rec = Arc::new(Recorder::default());
    r.register(RouteKind::Request, rec.handler(RouteKind::Request));
    r.register(RouteKind::Unknown, rec.handler(RouteKind::Unknown));

    assert!(!r.route_raw(&json!({ "type": "request" })));
    assert!(rec.seen().is_empty());

    let ok = message(MessageType::Request).to_json().unwrap();
    assert!(r.route_raw(&ok));
    assert_eq!(rec.seen().len(), 1);
}

#[tokio::test]
async fn synchronous_handlers_observe_arrival_order() {
    let r = router();
    let rec = Arc::new(Recorder::default());
    r.register(RouteKind::StreamChunk, rec.handler(RouteKind::StreamChunk));

    let ids: Vec<String> = (0..100)
        .map(|_| {
            let msg = message(MessageType::StreamChunk);
            let id = msg.message_id.clone();
            r.route(msg);
            id
        })
        .collect();

    let seen: Vec<String> = rec.seen().into_iter().map(|(_, id)| id).collect();
    assert_eq!(seen, ids);
}

#[tokio::test]
async fn returned_work_is_spawned() {
    let r = router();
    let (tx, rx) = tokio::sync::oneshot::channel();
    let tx = Mutex::new(Some(tx));
    r.register(
        RouteKind::Request,
        Arc::new(move |msg: Message| -> Dispatch {
            let tx = tx.lock().take()?;
            Some(
                async move {
                    let _ = tx.send(msg.message_id);
                }
                .boxed(),
            )
        }),
    );

    let msg = message(MessageType::Request);
    let id = msg.message_id.clone();
    assert!(r.route(msg));
    assert_eq!(rx.await.unwrap(), id);
}

#[tokio::test]
async fn re_registering_replaces_the_handler() {
    let r = router();
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    r.register(RouteKind::Broadcast, first.handler(RouteKind::Broadcast));
    r.register(RouteKind::Broadcast, second.handler(RouteKind::Broadcast));

    r.route(message(MessageType::Broadcast));
    assert!(first.seen().is_empty());
    assert_eq!(second.seen().len(), 1);

    r.unregister(RouteKind::Broadcast);
    assert!(!r.route(message(MessageType::Broadcast)));
}
