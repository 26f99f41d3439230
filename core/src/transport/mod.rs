//! Delivery substrate beneath the bus.
//!
//! A [`Transport`] moves serialized messages between endpoints and reports
//! connection state. What happens to sends while disconnected (queue or fail
//! fast) is configured through [`TransportConfig`], not decided inside the
//! transport.

pub mod local;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::message::Message;
use crate::queue::{MemoryQueue, OfflineQueue, OverflowPolicy};
use crate::{MeshError, Result};

pub use local::{LocalHub, LocalTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
}

/// One raw message handed up to the bus.
///
/// `identity` is the authenticated identity of the peer, when the transport
/// has one; in-process endpoints leave it empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub raw: Value,
    pub identity: Option<String>,
}

impl Inbound {
    pub fn new(raw: Value) -> Self {
        Self {
            raw,
            identity: None,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one message. Fails with `MeshError::Transport` on transient
    /// delivery failures, which the bus retries.
    async fn send(&self, message: &Message) -> Result<()>;

    /// Hands out the inbound receiver. Only the first call gets it.
    fn take_inbound(&self) -> Option<mpsc::Receiver<Inbound>>;

    fn state(&self) -> ConnectionState;

    /// Connection state changes (`connected`, `disconnected`, `reconnecting`).
    fn watch_state(&self) -> watch::Receiver<ConnectionState>;

    async fn close(&self);
}

/// Outbound behavior while disconnected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DisconnectedPolicy {
    Queue {
        capacity: usize,
        overflow: OverflowPolicy,
    },
    FailFast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Bound on each endpoint's inbound channel.
    pub inbox_capacity: usize,
    pub when_disconnected: DisconnectedPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 1024,
            when_disconnected: DisconnectedPolicy::Queue {
                capacity: 1000,
                overflow: OverflowPolicy::DropOldest,
            },
        }
    }
}

impl TransportConfig {
    /// In-memory queue matching the configured policy; `None` for fail-fast.
    pub fn build_queue(&self) -> Option<Arc<dyn OfflineQueue>> {
        match &self.when_disconnected {
            DisconnectedPolicy::Queue { capacity, overflow } => {
                Some(Arc::new(MemoryQueue::new(*capacity, *overflow)))
            }
            DisconnectedPolicy::FailFast => None,
        }
    }
}

/// Applies the disconnected policy to one outbound message.
pub fn hold_while_disconnected(
    queue: Option<&Arc<dyn OfflineQueue>>,
    endpoint: &str,
    message: &Message,
) -> Result<()> {
    match queue {
        Some(queue) => queue.enqueue(message.clone()),
        None => Err(MeshError::Transport(format!(
            "endpoint {endpoint} is disconnected"
        ))),
    }
}
