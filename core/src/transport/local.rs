//! In-process transport: a hub brokering between co-located endpoints.
//!
//! Each attached endpoint owns a bounded inbox. Messages cross the hub as
//! JSON values, never as shared references, so endpoints stay isolated.
//! Delivery from one sender to one receiver is FIFO because each inbox is a
//! single ordered channel and senders await each push.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{hold_while_disconnected, ConnectionState, Inbound, Transport, TransportConfig};
use crate::message::Message;
use crate::queue::OfflineQueue;
use crate::{MeshError, Result};

struct Port {
    attachment: u64,
    inbox: mpsc::Sender<Inbound>,
    state: watch::Receiver<ConnectionState>,
}

/// Central broker for in-process endpoints.
pub struct LocalHub {
    ports: DashMap<String, Port>,
    config: TransportConfig,
    next_attachment: AtomicU64,
}

impl LocalHub {
    pub fn new(config: TransportConfig) -> Arc<Self> {
        Arc::new(Self {
            ports: DashMap::new(),
            config,
            next_attachment: AtomicU64::new(1),
        })
    }

    /// Attaches a named endpoint and returns its transport.
    pub fn attach(self: &Arc<Self>, endpoint: impl Into<String>) -> Result<LocalTransport> {
        let queue = self.config.build_queue();
        self.attach_with_queue(endpoint, queue)
    }

    /// Like [`attach`](Self::attach) with a caller-supplied outbound queue
    /// (e.g. a durable one); `None` fails fast while disconnected.
    pub fn attach_with_queue(
        self: &Arc<Self>,
        endpoint: impl Into<String>,
        queue: Option<Arc<dyn OfflineQueue>>,
    ) -> Result<LocalTransport> {
        let endpoint = endpoint.into();
        let (tx, rx) = mpsc::channel(self.config.inbox_capacity.max(1));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let attachment = self.next_attachment.fetch_add(1, Ordering::Relaxed);

        match self.ports.entry(endpoint.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(MeshError::Config(format!(
                    "endpoint {endpoint} is already attached"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(Port {
                    attachment,
                    inbox: tx,
                    state: state_rx,
                });
            }
        }
        info!(target: "transport", endpoint = %endpoint, "Endpoint attached to local hub");

        Ok(LocalTransport {
            endpoint,
            attachment,
            hub: Arc::downgrade(self),
            inbound: Mutex::new(Some(rx)),
            state: state_tx,
            queue,
        })
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.ports.iter().map(|p| p.key().clone()).collect()
    }

    /// Removes the port only if it still belongs to `attachment`, so a stale
    /// transport cannot detach an endpoint that re-attached under its name.
    fn detach(&self, endpoint: &str, attachment: u64) {
        if self
            .ports
            .remove_if(endpoint, |_, port| port.attachment == attachment)
            .is_some()
        {
            info!(target: "transport", endpoint = %endpoint, "Endpoint detached from local hub");
        }
    }

    async fn deliver(&self, message: &Message) -> Result<()> {
        let raw = message.to_json()?;

        if message.is_broadcast() {
            // Collect first so no map guard is held across an await.
            let audience: Vec<(String, mpsc::Sender<Inbound>)> = self
                .ports
                .iter()
                .filter(|p| p.key() != &message.source_worker)
                .filter(|p| *p.value().state.borrow() == ConnectionState::Connected)
                .map(|p| (p.key().clone(), p.value().inbox.clone()))
                .collect();
            for (name, inbox) in audience {
                if inbox.send(Inbound::new(raw.clone())).await.is_err() {
                    debug!(target: "transport", endpoint = %name, "Broadcast receiver gone");
                }
            }
            return Ok(());
        }

        let inbox = {
            let port = self.ports.get(&message.target_worker).ok_or_else(|| {
                MeshError::Transport(format!(
                    "endpoint {} is not attached",
                    message.target_worker
                ))
            })?;
            if *port.state.borrow() != ConnectionState::Connected {
                return Err(MeshError::Transport(format!(
                    "endpoint {} is disconnected",
                    message.target_worker
                )));
            }
            port.inbox.clone()
        };
        inbox.send(Inbound::new(raw)).await.map_err(|_| {
            MeshError::Transport(format!("endpoint {} closed", message.target_worker))
        })
    }
}

/// One endpoint's side of the [`LocalHub`].
pub struct LocalTransport {
    endpoint: String,
    attachment: u64,
    hub: Weak<LocalHub>,
    inbound: Mutex<Option<mpsc::Receiver<Inbound>>>,
    state: watch::Sender<ConnectionState>,
    queue: Option<Arc<dyn OfflineQueue>>,
}

impl LocalTransport {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Simulates losing the connection: outbound sends follow the
    /// disconnected policy and the hub stops delivering to this endpoint.
    pub fn disconnect(&self) {
        warn!(target: "transport", endpoint = %self.endpoint, "Local transport disconnected");
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Restores the connection and flushes queued messages in order.
    ///
    /// Sends made while the backlog drains are queued behind it and go out
    /// in the same pass, so nothing is left behind once the state reads
    /// `Connected`.
    pub async fn reconnect(&self) -> Result<()> {
        self.state.send_replace(ConnectionState::Reconnecting);
        let hub = self.hub()?;
        if let Some(queue) = &self.queue {
            loop {
                let batch = queue.drain_all();
                if batch.is_empty() {
                    break;
                }
                self.flush(&hub, queue, batch).await?;
            }
        }
        self.state.send_replace(ConnectionState::Connected);
        // A sender that read the old state just before the flip may still
        // have queued behind us.
        if let Some(queue) = &self.queue {
            let stragglers = queue.drain_all();
            if !stragglers.is_empty() {
                self.flush(&hub, queue, stragglers).await?;
            }
        }
        info!(target: "transport", endpoint = %self.endpoint, "Local transport reconnected");
        Ok(())
    }

    async fn flush(
        &self,
        hub: &LocalHub,
        queue: &Arc<dyn OfflineQueue>,
        batch: Vec<Message>,
    ) -> Result<()> {
        let mut pending = batch.into_iter();
        while let Some(message) = pending.next() {
            if let Err(e) = hub.deliver(&message).await {
                // Put back what has not gone out, ahead of anything queued since.
                let later = queue.drain_all();
                for rest in std::iter::once(message).chain(pending).chain(later) {
                    let _ = queue.enqueue(rest);
                }
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn queued(&self) -> usize {
        self.queue.as_ref().map_or(0, |q| q.size())
    }

    fn hub(&self) -> Result<Arc<LocalHub>> {
        self.hub
            .upgrade()
            .ok_or_else(|| MeshError::Transport("local hub dropped".into()))
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, message: &Message) -> Result<()> {
        if *self.state.borrow() != ConnectionState::Connected {
            return hold_while_disconnected(self.queue.as_ref(), &self.endpoint, message);
        }
        self.hub()?.deliver(message).await
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<Inbound>> {
        self.inbound.lock().take()
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn close(&self) {
        self.state.send_replace(ConnectionState::Disconnected);
        if let Some(hub) = self.hub.upgrade() {
            hub.detach(&self.endpoint, self.attachment);
        }
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.detach(&self.endpoint, self.attachment);
        }
    }
}
