//! Network relay for endpoints living in other processes.
//!
//! Each remote endpoint opens one `MeshTransport.Attach` stream, names itself
//! with a `Hello` frame and then exchanges JSON envelopes. The relay validates
//! every envelope, applies per-client admission control and forwards it to
//! its target (or to everyone, for broadcasts).

pub mod auth;
pub mod client;
pub mod config;

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tonic::codegen::InterceptedService;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use weave_core::rate_limit::{client_key, rejection};
use weave_core::{ErrorInfo, Message, MessageType, MessageValidator, RateLimiter};
use weave_proto::{
    frame,
    mesh_transport_server::{MeshTransport, MeshTransportServer},
    Frame,
};

pub use auth::{AuthInterceptor, AuthRejection, Authenticator, Identity, TokenAuthenticator};
pub use client::{GrpcTransport, GrpcTransportConfig};
pub use config::BridgeConfig;

/// Codes carried by `Notice` frames.
pub mod notice_codes {
    pub const INVALID_MESSAGE: u32 = 4400;
    pub const UNAUTHORIZED: u32 = 4401;
    pub const SOURCE_MISMATCH: u32 = 4403;
    pub const UNKNOWN_TARGET: u32 = 4404;
    pub const REPLACED: u32 = 4409;
    pub const RATE_LIMITED: u32 = 4429;
}

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

const OUTBOUND_CAPACITY: usize = 512;

struct Connection {
    id: u64,
    tx: mpsc::Sender<Frame>,
}

#[derive(Clone)]
pub struct BridgeState {
    pub validator: Arc<MessageValidator>,
    pub limiter: Arc<RateLimiter>,
    // endpoint name -> sender feeding its outbound gRPC stream
    connections: Arc<DashMap<String, Connection>>,
    next_connection: Arc<AtomicU64>,
}

impl BridgeState {
    pub fn new(validator: Arc<MessageValidator>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            validator,
            limiter,
            connections: Arc::new(DashMap::new()),
            next_connection: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            Arc::new(MessageValidator::new(config.mesh.validation.clone())),
            Arc::new(RateLimiter::new(config.mesh.rate_limit.clone())),
        )
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.connections.iter().map(|c| c.key().clone()).collect()
    }

    pub fn is_attached(&self, endpoint: &str) -> bool {
        self.connections.contains_key(endpoint)
    }

    /// Ends every attached stream; endpoints see the relay go away and start
    /// re-attaching.
    pub fn disconnect_all(&self) -> usize {
        let count = self.connections.len();
        self.connections.clear();
        if count > 0 {
            info!(target: "bridge", count, "Dropped all attachments");
        }
        count
    }

    fn register(&self, endpoint: &str) -> (u64, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        if let Some(old) = self
            .connections
            .insert(endpoint.to_string(), Connection { id, tx })
        {
            // Newest attachment wins; the old stream is told why it went quiet.
            let _ = old
                .tx
                .try_send(Frame::notice(notice_codes::REPLACED, "endpoint re-attached"));
            info!(target: "bridge", endpoint = %endpoint, "Replaced existing attachment");
        }
        (id, rx)
    }

    fn unregister(&self, endpoint: &str, id: u64) {
        self.connections.remove_if(endpoint, |_, c| c.id == id);
    }

    fn sender(&self, endpoint: &str) -> Option<mpsc::Sender<Frame>> {
        self.connections.get(endpoint).map(|c| c.tx.clone())
    }

    async fn send_message(&self, endpoint: &str, message: &Message) {
        let Some(tx) = self.sender(endpoint) else {
            return;
        };
        match message.to_bytes() {
            Ok(bytes) => {
                let _ = tx.send(Frame::envelope(bytes)).await;
            }
            Err(e) => warn!(target: "bridge", endpoint = %endpoint, error = %e, "Could not encode relay reply"),
        }
    }

    async fn notify(&self, endpoint: &str, code: u32, reason: impl Into<String>) {
        if let Some(tx) = self.sender(endpoint) {
            let _ = tx.send(Frame::notice(code, reason)).await;
        }
    }

    /// Validates, admits and forwards one envelope from `origin`.
    pub async fn relay(&self, origin: &str, identity: Option<&str>, bytes: Vec<u8>) {
        let message = match self.validator.validate_bytes(&bytes) {
            Ok(message) => message,
            Err(e) => {
                debug!(target: "bridge", endpoint = %origin, error = %e, "Rejected envelope");
                self.notify(origin, notice_codes::INVALID_MESSAGE, e.to_string())
                    .await;
                return;
            }
        };

        if message.source_worker != origin {
            warn!(target: "bridge", endpoint = %origin, claimed = %message.source_worker, "Envelope source does not match attachment");
            self.notify(
                origin,
                notice_codes::SOURCE_MISMATCH,
                format!("sourceWorker must be {origin}"),
            )
            .await;
            return;
        }

        let admits_work = matches!(
            message.kind,
            MessageType::Request | MessageType::StreamRequest | MessageType::Broadcast
        );
        if admits_work {
            let decision = self.limiter.check(client_key(identity, origin));
            if !decision.allowed {
                let retry_after = decision.retry_after_seconds.unwrap_or(1);
                warn!(target: "bridge", endpoint = %origin, retry_after, "Relay rate limit exceeded");
                match rejection(&message, retry_after) {
                    Some(reply) => self.send_message(origin, &reply).await,
                    None => {
                        self.notify(
                            origin,
                            notice_codes::RATE_LIMITED,
                            format!("rate limit exceeded, retry after {retry_after}s"),
                        )
                        .await
                    }
                }
                return;
            }
        }

        if message.is_broadcast() {
            let audience: Vec<(String, mpsc::Sender<Frame>)> = self
                .connections
                .iter()
                .filter(|c| c.key() != origin)
                .map(|c| (c.key().clone(), c.value().tx.clone()))
                .collect();
            for (name, tx) in audience {
                if tx.send(Frame::envelope(bytes.clone())).await.is_err() {
                    debug!(target: "bridge", endpoint = %name, "Broadcast receiver gone");
                }
            }
            return;
        }

        match self.sender(&message.target_worker) {
            Some(tx) => {
                if tx.send(Frame::envelope(bytes)).await.is_err() {
                    debug!(target: "bridge", target_endpoint = %message.target_worker, "Target stream closed mid-relay");
                }
            }
            None => self.unknown_target(origin, &message).await,
        }
    }

    /// Answers work sent to an endpoint nobody attached, so callers fail fast
    /// instead of waiting out their timeout.
    async fn unknown_target(&self, origin: &str, message: &Message) {
        let reason = format!("endpoint {} is not attached", message.target_worker);
        let error = ErrorInfo::new(weave_core::error_names::TRANSPORT, reason.clone());
        let reply = match message.kind {
            MessageType::Request => Some(message.reply(Err(error))),
            MessageType::StreamRequest => Some(
                message
                    .stream_reply(MessageType::StreamError, serde_json::Value::Null)
                    .with_error(error),
            ),
            _ => None,
        };
        match reply {
            Some(reply) => self.send_message(origin, &reply).await,
            None => {
                self.notify(origin, notice_codes::UNKNOWN_TARGET, reason)
                    .await
            }
        }
    }
}

#[derive(Clone)]
pub struct BridgeService {
    state: BridgeState,
}

impl BridgeService {
    pub fn new(state: BridgeState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &BridgeState {
        &self.state
    }
}

#[tonic::async_trait]
impl MeshTransport for BridgeService {
    type AttachStream =
        Pin<Box<dyn futures_core::Stream<Item = std::result::Result<Frame, Status>> + Send>>;

    async fn attach(
        &self,
        request: Request<Streaming<Frame>>,
    ) -> std::result::Result<Response<Self::AttachStream>, Status> {
        let identity = request.extensions().get::<Identity>().map(|i| i.0.clone());
        let mut inbound = request.into_inner();

        // Lightweight handshake: the first frame names the endpoint.
        let endpoint = match inbound.message().await? {
            Some(Frame {
                kind: Some(frame::Kind::Hello(hello)),
            }) if !hello.endpoint.trim().is_empty() => hello.endpoint,
            Some(_) => {
                return Err(Status::invalid_argument(
                    "first frame must be Hello naming the endpoint",
                ))
            }
            None => return Err(Status::invalid_argument("no first frame")),
        };

        let (connection, rx) = self.state.register(&endpoint);
        info!(target: "bridge", endpoint = %endpoint, identity = ?identity, "Endpoint attached to relay");

        let state = self.state.clone();
        let endpoint_for_inbound = endpoint.clone();
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(frame)) => match frame.kind {
                        Some(frame::Kind::Envelope(bytes)) => {
                            state
                                .relay(&endpoint_for_inbound, identity.as_deref(), bytes)
                                .await
                        }
                        Some(frame::Kind::Notice(n)) => {
                            debug!(target: "bridge", endpoint = %endpoint_for_inbound, code = n.code, reason = %n.reason, "Notice from endpoint")
                        }
                        Some(frame::Kind::Hello(_)) | None => {}
                    },
                    Ok(None) => break,
                    Err(status) => {
                        debug!(target: "bridge", endpoint = %endpoint_for_inbound, %status, "Attach stream errored");
                        break;
                    }
                }
            }
            state.unregister(&endpoint_for_inbound, connection);
            info!(target: "bridge", endpoint = %endpoint_for_inbound, "Endpoint detached from relay");
        });

        let outbound = ReceiverStream::new(rx).map(Ok);
        Ok(Response::new(Box::pin(outbound) as Self::AttachStream))
    }
}

/// The relay service wrapped in its authentication interceptor.
pub fn service(
    state: BridgeState,
    authenticator: Option<Arc<dyn Authenticator>>,
) -> InterceptedService<MeshTransportServer<BridgeService>, AuthInterceptor> {
    MeshTransportServer::with_interceptor(
        BridgeService::new(state),
        AuthInterceptor::new(authenticator),
    )
}

pub async fn start_server(config: BridgeConfig) -> Result<()> {
    let addr: SocketAddr = config.addr;
    let state = BridgeState::from_config(&config);
    let _sweeper = state.limiter.spawn_sweeper();
    let authenticator = config.authenticator()?;
    if authenticator.is_none() {
        warn!(target: "bridge", "No bridge tokens configured; accepting anonymous endpoints");
    }

    info!(target: "bridge", %addr, "Starting Weave Bridge gRPC relay");
    let served = tonic::transport::Server::builder()
        .add_service(service(state.clone(), authenticator))
        .serve(addr)
        .await;
    state.disconnect_all();
    served.map_err(|e| BridgeError::Internal(e.to_string()))
}
