//! Outbound queue for messages sent while a transport is disconnected.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::message::Message;
use crate::{MeshError, Result};

/// What a full queue does with one more message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    DropOldest,
    RejectNew,
}

/// Storage for undeliverable outbound messages.
///
/// A durable implementation (object store, disk) can stand in for
/// [`MemoryQueue`]; the transport only relies on these three operations.
pub trait OfflineQueue: Send + Sync {
    fn enqueue(&self, message: Message) -> Result<()>;
    /// Removes and returns everything queued, oldest first.
    fn drain_all(&self) -> Vec<Message>;
    fn size(&self) -> usize;
}

/// Bounded in-memory FIFO.
pub struct MemoryQueue {
    capacity: usize,
    overflow: OverflowPolicy,
    items: Mutex<VecDeque<Message>>,
}

impl MemoryQueue {
    pub fn new(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            overflow,
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl OfflineQueue for MemoryQueue {
    fn enqueue(&self, message: Message) -> Result<()> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            match self.overflow {
                OverflowPolicy::RejectNew => return Err(MeshError::QueueFull),
                OverflowPolicy::DropOldest => {
                    if let Some(dropped) = items.pop_front() {
                        warn!(target: "transport", message_id = %dropped.message_id, "Outbound queue full, dropping oldest message");
                    }
                }
            }
        }
        items.push_back(message);
        Ok(())
    }

    fn drain_all(&self) -> Vec<Message> {
        self.items.lock().drain(..).collect()
    }

    fn size(&self) -> usize {
        self.items.lock().len()
    }
}
