// Message Router implementation
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::message::{Message, MessageType};
use crate::validator::MessageValidator;

/// Handler category a message is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteKind {
    Request,
    StreamRequest,
    Response,
    StreamChunk,
    StreamEnd,
    StreamError,
    Broadcast,
    Unknown,
}

impl From<MessageType> for RouteKind {
    fn from(kind: MessageType) -> Self {
        match kind {
            MessageType::Request => RouteKind::Request,
            MessageType::StreamRequest => RouteKind::StreamRequest,
            MessageType::Response => RouteKind::Response,
            MessageType::StreamChunk => RouteKind::StreamChunk,
            MessageType::StreamEnd => RouteKind::StreamEnd,
            MessageType::StreamError => RouteKind::StreamError,
            MessageType::Broadcast => RouteKind::Broadcast,
        }
    }
}

/// Pending work a handler hands back to the router.
///
/// `None` means the handler finished synchronously. A returned future is
/// spawned and never awaited by the router.
pub type Dispatch = Option<BoxFuture<'static, ()>>;

/// Handler for one route category.
///
/// `handle` runs inline, in arrival order, so bookkeeping that must respect
/// per-connection FIFO (resolving calls, feeding streams) belongs in the
/// synchronous part. Anything slow goes into the returned future.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: Message) -> Dispatch;
}

impl<F> MessageHandler for F
where
    F: Fn(Message) -> Dispatch + Send + Sync,
{
    fn handle(&self, message: Message) -> Dispatch {
        self(message)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouterStats {
    pub delivered: u64,
    pub unroutable: u64,
}

/// Dispatches validated messages to exactly one registered handler category.
pub struct MessageRouter {
    handlers: DashMap<RouteKind, Arc<dyn MessageHandler>>,
    validator: Arc<MessageValidator>,
    delivered: AtomicU64,
    unroutable: AtomicU64,
}

impl MessageRouter {
    pub fn new(validator: Arc<MessageValidator>) -> Self {
        Self {
            handlers: DashMap::new(),
            validator,
            delivered: AtomicU64::new(0),
            unroutable: AtomicU64::new(0),
        }
    }

    /// Installs the handler for a category; a later registration replaces it.
    pub fn register(&self, kind: RouteKind, handler: Arc<dyn MessageHandler>) {
        debug!(target: "router", ?kind, "Registering route handler");
        self.handlers.insert(kind, handler);
    }

    pub fn unregister(&self, kind: RouteKind) {
        self.handlers.remove(&kind);
    }

    /// Validates raw input, then routes it. Invalid input is never dispatched.
    pub fn route_raw(&self, raw: &Value) -> bool {
        match self.validator.validate(raw) {
            Ok(message) => self.route(message),
            Err(_) => {
                self.unroutable.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Dispatches `message` by type.
    ///
    /// Returns `false` when no handler is registered for its category; the
    /// message then goes to the `Unknown` fallback if one is installed.
    pub fn route(&self, message: Message) -> bool {
        let kind = RouteKind::from(message.kind);
        let handler = self.handlers.get(&kind).map(|h| Arc::clone(h.value()));

        match handler {
            Some(handler) => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Self::dispatch(handler.as_ref(), message);
                true
            }
            None => {
                self.unroutable.fetch_add(1, Ordering::Relaxed);
                let fallback = self
                    .handlers
                    .get(&RouteKind::Unknown)
                    .map(|h| Arc::clone(h.value()));
                match fallback {
                    Some(fallback) => Self::dispatch(fallback.as_ref(), message),
                    None => {
                        warn!(target: "router", message_id = %message.message_id, kind = %message.kind, "No handler for message type");
                    }
                }
                false
            }
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            unroutable: self.unroutable.load(Ordering::Relaxed),
        }
    }

    fn dispatch(handler: &dyn MessageHandler, message: Message) {
        if let Some(pending) = handler.handle(message) {
            tokio::spawn(pending);
        }
    }
}
