//! Network transport: a [`Transport`] backed by the relay's Attach stream.
//!
//! The transport owns one session at a time. When the stream drops it flips
//! to `reconnecting`, re-attaches with the configured backoff and flushes
//! whatever the offline queue held, oldest first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::Endpoint;
use tonic::{Code, Request, Status, Streaming};
use tracing::{debug, info, warn};

use weave_core::queue::OfflineQueue;
use weave_core::transport::hold_while_disconnected;
use weave_core::{
    ConnectionState, Inbound, MeshError, Message, RetryPolicy, Transport, TransportConfig,
};
use weave_proto::{frame, mesh_transport_client::MeshTransportClient, Frame};

const SESSION_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct GrpcTransportConfig {
    /// Relay URL, e.g. `http://127.0.0.1:50051`.
    pub url: String,
    pub token: Option<String>,
    /// Backoff between re-attach attempts. Each round runs the whole policy;
    /// rounds repeat until the transport is closed.
    pub reconnect: RetryPolicy,
    pub transport: TransportConfig,
}

impl GrpcTransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            reconnect: RetryPolicy {
                max_attempts: 5,
                base_delay_ms: 250,
                ..RetryPolicy::default()
            },
            transport: TransportConfig::default(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

pub struct GrpcTransport {
    endpoint: String,
    config: GrpcTransportConfig,
    session: Mutex<Option<mpsc::Sender<Frame>>>,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Inbound>>>,
    state: watch::Sender<ConnectionState>,
    queue: Option<Arc<dyn OfflineQueue>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Auth and handshake refusals are final; everything else is worth retrying.
fn status_to_error(status: Status) -> MeshError {
    match status.code() {
        Code::Unauthenticated | Code::PermissionDenied | Code::InvalidArgument => {
            MeshError::Remote {
                name: format!("{:?}", status.code()),
                message: status.message().to_string(),
                stack: None,
            }
        }
        _ => MeshError::Transport(status.to_string()),
    }
}

impl GrpcTransport {
    /// Attaches to the relay and starts the session supervisor.
    ///
    /// Fails if the first attach does not succeed within the reconnect policy.
    pub async fn connect(
        endpoint: impl Into<String>,
        config: GrpcTransportConfig,
    ) -> weave_core::Result<Arc<Self>> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.transport.inbox_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Reconnecting);
        let queue = config.transport.build_queue();
        let transport = Arc::new(Self {
            endpoint: endpoint.into(),
            config,
            session: Mutex::new(None),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            state,
            queue,
            supervisor: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let stream = transport
            .config
            .reconnect
            .run(|_| transport.open_session())
            .await?;
        transport.state.send_replace(ConnectionState::Connected);
        info!(target: "transport", endpoint = %transport.endpoint, url = %transport.config.url, "Attached to relay");

        let task = tokio::spawn(supervise(Arc::downgrade(&transport), stream));
        *transport.supervisor.lock() = Some(task);
        Ok(transport)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn queued(&self) -> usize {
        self.queue.as_ref().map_or(0, |q| q.size())
    }

    /// Opens a fresh Attach stream and installs its sender as the session.
    async fn open_session(&self) -> weave_core::Result<Streaming<Frame>> {
        let channel = Endpoint::from_shared(self.config.url.clone())
            .map_err(|e| MeshError::Config(e.to_string()))?
            .connect()
            .await
            .map_err(|e| MeshError::Transport(e.to_string()))?;
        let mut client = MeshTransportClient::new(channel);

        let (tx, rx) = mpsc::channel(SESSION_BUFFER);
        // Queued before the call so the relay sees Hello first.
        tx.send(Frame::hello(self.endpoint.clone()))
            .await
            .map_err(|_| MeshError::Transport("session closed during handshake".into()))?;

        let mut request = Request::new(ReceiverStream::new(rx));
        if let Some(token) = &self.config.token {
            let value = format!("Bearer {token}")
                .parse::<AsciiMetadataValue>()
                .map_err(|_| MeshError::Config("token is not valid metadata".into()))?;
            request.metadata_mut().insert("authorization", value);
        }

        let stream = client
            .attach(request)
            .await
            .map_err(status_to_error)?
            .into_inner();
        *self.session.lock() = Some(tx);
        Ok(stream)
    }

    async fn flush_queue(&self) -> weave_core::Result<()> {
        let Some(queue) = &self.queue else {
            return Ok(());
        };
        // Sends that saw the old state can land in the queue mid-flush.
        loop {
            let batch = queue.drain_all();
            if batch.is_empty() {
                return Ok(());
            }
            let mut pending = batch.into_iter();
            while let Some(message) = pending.next() {
                if let Err(e) = self.write(&message).await {
                    let later = queue.drain_all();
                    for rest in std::iter::once(message).chain(pending).chain(later) {
                        let _ = queue.enqueue(rest);
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn write(&self, message: &Message) -> weave_core::Result<()> {
        let tx = self
            .session
            .lock()
            .clone()
            .ok_or_else(|| MeshError::Transport("no active session".into()))?;
        tx.send(Frame::envelope(message.to_bytes()?))
            .await
            .map_err(|_| MeshError::Transport("session closed".into()))
    }

    fn mark_disconnected(&self) {
        self.session.lock().take();
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

/// Pumps inbound frames until the stream ends, then re-attaches.
async fn supervise(transport: Weak<GrpcTransport>, mut stream: Streaming<Frame>) {
    loop {
        let Some(inbound_tx) = transport.upgrade().map(|t| t.inbound_tx.clone()) else {
            return;
        };
        pump(&mut stream, &inbound_tx).await;
        drop(inbound_tx);

        match transport.upgrade() {
            Some(t) => {
                t.mark_disconnected();
                if t.closed.load(Ordering::SeqCst) {
                    return;
                }
                warn!(target: "transport", endpoint = %t.endpoint, "Relay stream lost, reconnecting");
            }
            None => return,
        }

        loop {
            let Some(t) = transport.upgrade() else {
                return;
            };
            if t.closed.load(Ordering::SeqCst) {
                return;
            }
            t.state.send_replace(ConnectionState::Reconnecting);
            match t.config.reconnect.run(|_| t.open_session()).await {
                Ok(next) => {
                    t.state.send_replace(ConnectionState::Connected);
                    if let Err(e) = t.flush_queue().await {
                        warn!(target: "transport", endpoint = %t.endpoint, error = %e, "Queue flush interrupted");
                    }
                    info!(target: "transport", endpoint = %t.endpoint, "Re-attached to relay");
                    stream = next;
                    break;
                }
                Err(e) if !e.is_retryable() => {
                    warn!(target: "transport", endpoint = %t.endpoint, error = %e, "Relay refused re-attach");
                    t.mark_disconnected();
                    return;
                }
                Err(e) => {
                    t.mark_disconnected();
                    let pause = Duration::from_millis(t.config.reconnect.max_delay_ms);
                    debug!(target: "transport", endpoint = %t.endpoint, error = %e, pause_ms = pause.as_millis() as u64, "Reconnect round failed");
                    drop(t);
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }
}

async fn pump(stream: &mut Streaming<Frame>, inbound: &mpsc::Sender<Inbound>) {
    loop {
        match stream.message().await {
            Ok(Some(frame)) => match frame.kind {
                Some(frame::Kind::Envelope(bytes)) => {
                    match serde_json::from_slice::<serde_json::Value>(&bytes) {
                        Ok(raw) => {
                            if inbound.send(Inbound::new(raw)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => debug!(target: "transport", error = %e, "Dropping undecodable envelope"),
                    }
                }
                Some(frame::Kind::Notice(notice)) => {
                    warn!(target: "transport", code = notice.code, reason = %notice.reason, "Relay notice")
                }
                Some(frame::Kind::Hello(_)) | None => {}
            },
            Ok(None) => return,
            Err(status) => {
                debug!(target: "transport", %status, "Relay stream errored");
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn send(&self, message: &Message) -> weave_core::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::Disposed);
        }
        if *self.state.borrow() != ConnectionState::Connected {
            return hold_while_disconnected(self.queue.as_ref(), &self.endpoint, message);
        }
        self.write(message).await
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<Inbound>> {
        self.inbound_rx.lock().take()
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.supervisor.lock().take() {
            task.abort();
        }
        self.mark_disconnected();
        info!(target: "transport", endpoint = %self.endpoint, "Relay transport closed");
    }
}

impl Drop for GrpcTransport {
    fn drop(&mut self) {
        if let Some(task) = self.supervisor.lock().take() {
            task.abort();
        }
    }
}
