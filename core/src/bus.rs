//! Per-endpoint message bus.
//!
//! `MessageBus` is the public face of one endpoint: fire-and-forget sends,
//! request/response calls, streams and broadcasts. It owns the transport, the
//! correlation table and the router, and applies the retry policy to every
//! outbound transmission.
//!
//! ```text
//! caller ─ request() ─▶ transport ─▶ (remote) router ─▶ handler
//!   ▲                                                      │
//!   └──── correlation table ◀── router ◀── transport ◀── response
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::correlation::{CorrelationTable, StreamHandlers, StreamReceiver};
use crate::message::{new_id, Message, MessageType};
use crate::rate_limit::{client_key, rejection, RateLimiter};
use crate::retry::RetryPolicy;
use crate::router::{Dispatch, MessageRouter, RouteKind};
use crate::transport::{Inbound, Transport};
use crate::validator::MessageValidator;
use crate::{MeshError, Result};

/// Handler name that catches requests no named handler claims.
pub const CATCH_ALL: &str = "*";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BusConfig {
    pub default_timeout_ms: u64,
    pub stream_idle_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            stream_idle_timeout_ms: 30_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl BusConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_idle_timeout_ms)
    }
}

/// Who asked, as seen by a request or stream handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub endpoint: String,
    pub source: String,
    pub message_id: String,
    pub trace_id: Option<String>,
}

impl RequestContext {
    fn from_message(msg: &Message) -> Self {
        Self {
            endpoint: msg.target_worker.clone(),
            source: msg.source_worker.clone(),
            message_id: msg.message_id.clone(),
            trace_id: msg.trace_id.clone(),
        }
    }
}

/// Answers `request` messages addressed to this endpoint.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, ctx: RequestContext, payload: Value) -> Result<Value>;
}

/// Produces the chunks of a `stream_request`.
///
/// Chunks go out through the sink; the returned value becomes the
/// `stream_end` payload and an error becomes `stream_error`.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn handle(&self, ctx: RequestContext, payload: Value, sink: StreamSink) -> Result<Value>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(RequestContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn handle(&self, ctx: RequestContext, payload: Value) -> Result<Value> {
        (self.0)(ctx, payload).await
    }
}

/// Wraps an async closure as a [`RequestHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn RequestHandler>
where
    F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct FnStreamHandler<F>(F);

#[async_trait]
impl<F, Fut> StreamHandler for FnStreamHandler<F>
where
    F: Fn(RequestContext, Value, StreamSink) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn handle(&self, ctx: RequestContext, payload: Value, sink: StreamSink) -> Result<Value> {
        (self.0)(ctx, payload, sink).await
    }
}

/// Wraps an async closure as a [`StreamHandler`].
pub fn stream_handler_fn<F, Fut>(f: F) -> Arc<dyn StreamHandler>
where
    F: Fn(RequestContext, Value, StreamSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnStreamHandler(f))
}

type BroadcastFn = Arc<dyn Fn(RequestContext, Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Outbound half handed to a [`StreamHandler`].
pub struct StreamSink {
    request: Message,
    bus: Weak<BusInner>,
    finished: Arc<AtomicBool>,
}

impl StreamSink {
    pub fn stream_id(&self) -> &str {
        self.request.stream_id.as_deref().unwrap_or_default()
    }

    /// Sends one `stream_chunk`. Chunks arrive in the order they are sent.
    pub async fn send(&self, chunk: Value) -> Result<()> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(MeshError::Validation(format!(
                "stream {} already ended",
                self.stream_id()
            )));
        }
        let bus = self.bus.upgrade().ok_or(MeshError::Disposed)?;
        bus.ensure_live()?;
        let msg = self.request.stream_reply(MessageType::StreamChunk, chunk);
        bus.transmit(&msg).await
    }
}

/// Observable bus activity.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Sent {
        message_id: String,
        kind: MessageType,
        target: String,
    },
    Received {
        message_id: String,
        kind: MessageType,
        source: String,
    },
    CallCompleted {
        message_id: String,
        latency_ms: f64,
        ok: bool,
    },
    Failed {
        kind: &'static str,
        message_id: Option<String>,
    },
    Dropped {
        reason: String,
    },
}

pub trait BusObserver: Send + Sync {
    fn on_event(&self, event: &BusEvent);
}

type ObserverRegistry = DashMap<u64, Arc<dyn BusObserver>>;

/// Keeps an observer registered; dropping it unsubscribes.
#[must_use = "dropping the guard unsubscribes the observer"]
pub struct ObserverGuard {
    registry: Weak<ObserverRegistry>,
    id: u64,
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusStats {
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    pub pending_calls: usize,
    pub open_streams: usize,
}

struct BusInner {
    name: String,
    config: BusConfig,
    transport: Arc<dyn Transport>,
    table: Arc<CorrelationTable>,
    router: MessageRouter,
    validator: Arc<MessageValidator>,
    limiter: Option<Arc<RateLimiter>>,
    handlers: DashMap<String, Arc<dyn RequestHandler>>,
    stream_handlers: DashMap<String, Arc<dyn StreamHandler>>,
    broadcast_handler: RwLock<Option<BroadcastFn>>,
    broadcast_queue: mpsc::UnboundedSender<Message>,
    observers: Arc<ObserverRegistry>,
    next_observer: AtomicU64,
    disposed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
}

/// Builder for [`MessageBus`]; collaborators not supplied get fresh defaults.
pub struct MessageBusBuilder {
    name: String,
    transport: Arc<dyn Transport>,
    config: BusConfig,
    validator: Option<Arc<MessageValidator>>,
    limiter: Option<Arc<RateLimiter>>,
}

impl MessageBusBuilder {
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn validator(mut self, validator: Arc<MessageValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Admission control for inbound requests, streams and broadcasts.
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Builds the bus and starts its inbound loop. Must run inside a tokio runtime.
    pub fn build(self) -> Result<MessageBus> {
        let inbound = self.transport.take_inbound().ok_or_else(|| {
            MeshError::Config(format!(
                "transport for {} has no inbound channel left",
                self.name
            ))
        })?;
        let validator = self.validator.unwrap_or_default();
        let (broadcast_queue, broadcasts) = mpsc::unbounded_channel();

        let inner = Arc::new_cyclic(|weak: &Weak<BusInner>| {
            let router = MessageRouter::new(Arc::clone(&validator));
            install_routes(&router, weak);
            BusInner {
                name: self.name,
                config: self.config,
                transport: self.transport,
                table: CorrelationTable::new(),
                router,
                validator,
                limiter: self.limiter,
                handlers: DashMap::new(),
                stream_handlers: DashMap::new(),
                broadcast_handler: RwLock::new(None),
                broadcast_queue,
                observers: Arc::new(DashMap::new()),
                next_observer: AtomicU64::new(1),
                disposed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                sent: AtomicU64::new(0),
                received: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }
        });

        let tasks = vec![
            tokio::spawn(inbound_loop(Arc::downgrade(&inner), inbound)),
            tokio::spawn(broadcast_loop(Arc::downgrade(&inner), broadcasts)),
        ];
        *inner.tasks.lock() = tasks;
        info!(target: "bus", endpoint = %inner.name, "Message bus started");

        Ok(MessageBus { inner })
    }
}

fn install_routes(router: &MessageRouter, weak: &Weak<BusInner>) {
    let w = weak.clone();
    router.register(
        RouteKind::Request,
        Arc::new(move |msg: Message| -> Dispatch {
            let inner = w.upgrade()?;
            Some(inner.answer_request(msg).boxed())
        }),
    );

    let w = weak.clone();
    router.register(
        RouteKind::StreamRequest,
        Arc::new(move |msg: Message| -> Dispatch {
            let inner = w.upgrade()?;
            Some(inner.answer_stream(msg).boxed())
        }),
    );

    // Replies are settled inline so they keep arrival order.
    let w = weak.clone();
    router.register(
        RouteKind::Response,
        Arc::new(move |msg: Message| -> Dispatch {
            w.upgrade()?.table.resolve(&msg);
            None
        }),
    );

    let w = weak.clone();
    router.register(
        RouteKind::StreamChunk,
        Arc::new(move |msg: Message| -> Dispatch {
            w.upgrade()?.table.push_chunk(&msg);
            None
        }),
    );

    for kind in [RouteKind::StreamEnd, RouteKind::StreamError] {
        let w = weak.clone();
        router.register(
            kind,
            Arc::new(move |msg: Message| -> Dispatch {
                w.upgrade()?.table.finish_stream(&msg);
                None
            }),
        );
    }

    // One-way messages are queued to a single worker so handlers see them in
    // arrival order.
    let w = weak.clone();
    router.register(
        RouteKind::Broadcast,
        Arc::new(move |msg: Message| -> Dispatch {
            let inner = w.upgrade()?;
            if inner.broadcast_queue.send(msg).is_err() {
                debug!(target: "bus", endpoint = %inner.name, "Broadcast worker stopped");
            }
            None
        }),
    );
}

async fn broadcast_loop(bus: Weak<BusInner>, mut queue: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = queue.recv().await {
        let handler = match bus.upgrade() {
            Some(inner) => inner.broadcast_handler.read().clone(),
            None => return,
        };
        let Some(handler) = handler else {
            debug!(target: "bus", message_id = %msg.message_id, "No broadcast handler installed");
            continue;
        };
        let ctx = RequestContext::from_message(&msg);
        if AssertUnwindSafe(handler(ctx, msg.payload))
            .catch_unwind()
            .await
            .is_err()
        {
            warn!(target: "bus", message_id = %msg.message_id, "Broadcast handler panicked");
        }
    }
}

async fn inbound_loop(bus: Weak<BusInner>, mut inbound: mpsc::Receiver<Inbound>) {
    while let Some(item) = inbound.recv().await {
        let Some(inner) = bus.upgrade() else {
            return;
        };
        if inner.is_disposed() {
            return;
        }
        inner.accept(item);
    }
}

impl BusInner {
    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(MeshError::Disposed)
        } else {
            Ok(())
        }
    }

    fn emit(&self, event: BusEvent) {
        let observers: Vec<Arc<dyn BusObserver>> =
            self.observers.iter().map(|o| Arc::clone(o.value())).collect();
        for observer in observers {
            observer.on_event(&event);
        }
    }

    fn drop_message(&self, reason: impl Into<String>) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.emit(BusEvent::Dropped {
            reason: reason.into(),
        });
    }

    /// Boundary checks for one inbound item, then routing.
    fn accept(self: &Arc<Self>, item: Inbound) {
        let msg = match self.validator.validate(&item.raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(target: "bus", endpoint = %self.name, error = %e, "Dropping invalid message");
                self.drop_message("validation");
                return;
            }
        };

        if msg.is_broadcast() {
            if msg.source_worker == self.name {
                return;
            }
        } else if msg.target_worker != self.name {
            warn!(target: "bus", endpoint = %self.name, target = %msg.target_worker, message_id = %msg.message_id, "Dropping misaddressed message");
            self.drop_message("misaddressed");
            return;
        }

        self.received.fetch_add(1, Ordering::Relaxed);
        self.emit(BusEvent::Received {
            message_id: msg.message_id.clone(),
            kind: msg.kind,
            source: msg.source_worker.clone(),
        });

        let admits_work = matches!(
            msg.kind,
            MessageType::Request | MessageType::StreamRequest | MessageType::Broadcast
        );
        if admits_work {
            if let Some(limiter) = &self.limiter {
                let key = client_key(item.identity.as_deref(), &msg.source_worker);
                let decision = limiter.check(key);
                if !decision.allowed {
                    let retry_after = decision.retry_after_seconds.unwrap_or(1);
                    self.reject_rate_limited(msg, retry_after);
                    return;
                }
            }
        }

        self.router.route(msg);
    }

    fn reject_rate_limited(self: &Arc<Self>, msg: Message, retry_after_seconds: u64) {
        warn!(target: "bus", endpoint = %self.name, source = %msg.source_worker, kind = %msg.kind, retry_after_seconds, "Inbound work denied by rate limiter");
        self.emit(BusEvent::Failed {
            kind: "rate_limited",
            message_id: Some(msg.message_id.clone()),
        });
        let reply = rejection(&msg, retry_after_seconds);
        match reply {
            Some(reply) => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(e) = inner.transmit(&reply).await {
                        warn!(target: "bus", error = %e, "Failed to deliver rate-limit rejection");
                    }
                });
            }
            None => self.drop_message("rate_limited"),
        }
    }

    /// Sends with the configured retry policy.
    async fn transmit(&self, msg: &Message) -> Result<()> {
        let result = self
            .config
            .retry
            .run(|_| self.transport.send(msg))
            .await;
        match &result {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                self.emit(BusEvent::Sent {
                    message_id: msg.message_id.clone(),
                    kind: msg.kind,
                    target: msg.target_worker.clone(),
                });
            }
            Err(e) => {
                warn!(target: "bus", endpoint = %self.name, message_id = %msg.message_id, error = %e, "Transmit failed");
                self.emit(BusEvent::Failed {
                    kind: e.kind(),
                    message_id: Some(msg.message_id.clone()),
                });
            }
        }
        result
    }

    fn lookup<T: ?Sized>(map: &DashMap<String, Arc<T>>, op: Option<&str>) -> Option<Arc<T>> {
        op.and_then(|op| map.get(op).map(|h| Arc::clone(h.value())))
            .or_else(|| map.get(CATCH_ALL).map(|h| Arc::clone(h.value())))
    }

    async fn answer_request(self: Arc<Self>, msg: Message) {
        let handler = Self::lookup(&self.handlers, msg.op());
        let result = match handler {
            Some(handler) => {
                let ctx = RequestContext::from_message(&msg);
                let run = handler.handle(ctx, msg.payload.clone());
                match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(MeshError::Remote {
                        name: "HandlerPanic".into(),
                        message: "request handler panicked".into(),
                        stack: None,
                    }),
                }
            }
            None => Err(MeshError::NoHandler(
                msg.op().unwrap_or(CATCH_ALL).to_string(),
            )),
        };

        if self.is_disposed() {
            return;
        }
        let reply = msg.reply(result.map_err(|e| e.to_error_info()));
        if let Err(e) = self.transmit(&reply).await {
            warn!(target: "bus", endpoint = %self.name, correlation_id = %msg.message_id, error = %e, "Could not deliver response");
        }
    }

    async fn answer_stream(self: Arc<Self>, msg: Message) {
        let handler = Self::lookup(&self.stream_handlers, msg.op());
        let outcome = match handler {
            Some(handler) => {
                let finished = Arc::new(AtomicBool::new(false));
                let sink = StreamSink {
                    request: msg.clone(),
                    bus: Arc::downgrade(&self),
                    finished: Arc::clone(&finished),
                };
                let ctx = RequestContext::from_message(&msg);
                let run = handler.handle(ctx, msg.payload.clone(), sink);
                let outcome = match AssertUnwindSafe(run).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(MeshError::Remote {
                        name: "HandlerPanic".into(),
                        message: "stream handler panicked".into(),
                        stack: None,
                    }),
                };
                finished.store(true, Ordering::SeqCst);
                outcome
            }
            None => Err(MeshError::NoHandler(
                msg.op().unwrap_or(CATCH_ALL).to_string(),
            )),
        };

        if self.is_disposed() {
            return;
        }
        let terminal = match outcome {
            Ok(payload) => msg.stream_reply(MessageType::StreamEnd, payload),
            Err(e) => msg
                .stream_reply(MessageType::StreamError, Value::Null)
                .with_error(e.to_error_info()),
        };
        if let Err(e) = self.transmit(&terminal).await {
            warn!(target: "bus", endpoint = %self.name, stream_id = ?msg.stream_id, error = %e, "Could not deliver stream terminal");
        }
    }

    fn shutdown(&self) -> usize {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.table.close(MeshError::Disposed)
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle to one endpoint's bus. Cheap to clone.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn builder(name: impl Into<String>, transport: Arc<dyn Transport>) -> MessageBusBuilder {
        MessageBusBuilder {
            name: name.into(),
            transport,
            config: BusConfig::default(),
            validator: None,
            limiter: None,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn validator(&self) -> &Arc<MessageValidator> {
        &self.inner.validator
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    /// Fire-and-forget notification to one endpoint; no correlation is kept.
    pub async fn send(&self, target: &str, payload: Value) -> Result<()> {
        self.inner.ensure_live()?;
        let msg = Message::new(MessageType::Broadcast, self.endpoint(), target, payload);
        self.inner.transmit(&msg).await
    }

    /// Sends to every other endpoint (`targetWorker = "*"`).
    pub async fn broadcast(&self, payload: Value) -> Result<()> {
        self.inner.ensure_live()?;
        let msg = Message::broadcast(self.endpoint(), payload);
        self.inner.transmit(&msg).await
    }

    /// Calls `target` and waits for its response.
    ///
    /// Fails with `Timeout` when no response arrives within `timeout`, with
    /// the remote error when the handler failed, and with `Disposed` if the
    /// bus shuts down first.
    pub async fn request(&self, target: &str, payload: Value, timeout: Duration) -> Result<Value> {
        self.request_message(Message::request(self.endpoint(), target, payload), timeout)
            .await
    }

    /// Like [`request`](Self::request), tagged with a trace id spanning a
    /// larger logical operation.
    pub async fn request_traced(
        &self,
        trace_id: &str,
        target: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let msg = Message::request(self.endpoint(), target, payload).with_trace(trace_id);
        self.request_message(msg, timeout).await
    }

    /// Typed request using the configured default timeout.
    pub async fn call<Req, Resp>(&self, target: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request)?;
        let value = self
            .request(target, payload, self.inner.config.default_timeout())
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn request_message(&self, msg: Message, timeout: Duration) -> Result<Value> {
        self.inner.ensure_live()?;
        let pending = self.inner.table.await_response(&msg.message_id, timeout)?;
        let started = Instant::now();

        // The deadline covers a transmit stalled by a backed-up peer too.
        match tokio::time::timeout(timeout, self.inner.transmit(&msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.inner.table.fail_call(&msg.message_id, e.clone());
                return Err(e);
            }
            Err(_) => {
                self.inner
                    .table
                    .fail_call(&msg.message_id, MeshError::Timeout(timeout.as_millis() as u64));
            }
        }

        let result = pending.await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.inner.emit(BusEvent::CallCompleted {
            message_id: msg.message_id.clone(),
            latency_ms,
            ok: result.is_ok(),
        });
        if let Err(e) = &result {
            self.inner.emit(BusEvent::Failed {
                kind: e.kind(),
                message_id: Some(msg.message_id.clone()),
            });
        }
        result
    }

    /// Opens a stream to `target`; returns its stream id.
    ///
    /// `handlers` receive every chunk, then exactly one of end or error.
    /// `idle_timeout` restarts on every chunk.
    pub async fn stream(
        &self,
        target: &str,
        payload: Value,
        handlers: Arc<dyn StreamHandlers>,
        idle_timeout: Duration,
    ) -> Result<String> {
        self.inner.ensure_live()?;
        let stream_id = new_id();
        self.start_stream(target, payload, &stream_id, handlers, idle_timeout)
            .await?;
        Ok(stream_id)
    }

    /// Channel flavor of [`stream`](Self::stream).
    pub async fn open_stream(
        &self,
        target: &str,
        payload: Value,
        idle_timeout: Duration,
    ) -> Result<StreamReceiver> {
        self.inner.ensure_live()?;
        let stream_id = new_id();
        let (handlers, receiver) = StreamReceiver::channel(stream_id.clone());
        self.start_stream(target, payload, &stream_id, handlers, idle_timeout)
            .await?;
        Ok(receiver)
    }

    async fn start_stream(
        &self,
        target: &str,
        payload: Value,
        stream_id: &str,
        handlers: Arc<dyn StreamHandlers>,
        idle_timeout: Duration,
    ) -> Result<()> {
        self.inner
            .table
            .open_stream(stream_id, idle_timeout, handlers)?;

        let msg = Message::stream_request(self.endpoint(), target, stream_id, payload);
        let error = match tokio::time::timeout(idle_timeout, self.inner.transmit(&msg)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(_) => MeshError::Timeout(idle_timeout.as_millis() as u64),
        };
        self.inner
            .table
            .terminate_stream(stream_id, Err(error.clone()));
        Err(error)
    }

    /// Installs the handler for requests whose payload `op` equals `name`.
    /// Register under [`CATCH_ALL`] to answer everything else.
    pub fn register_handler(&self, name: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        let name = name.into();
        debug!(target: "bus", endpoint = %self.endpoint(), handler = %name, "Registering request handler");
        self.inner.handlers.insert(name, handler);
    }

    pub fn register_stream_handler(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn StreamHandler>,
    ) {
        let name = name.into();
        debug!(target: "bus", endpoint = %self.endpoint(), handler = %name, "Registering stream handler");
        self.inner.stream_handlers.insert(name, handler);
    }

    /// Handles broadcasts and one-way notifications sent with [`send`](Self::send).
    pub fn on_broadcast<F, Fut>(&self, f: F)
    where
        F: Fn(RequestContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: BroadcastFn = Arc::new(move |ctx, payload| f(ctx, payload).boxed());
        *self.inner.broadcast_handler.write() = Some(handler);
    }

    /// Registers an observer until the returned guard is dropped.
    pub fn observe(&self, observer: Arc<dyn BusObserver>) -> ObserverGuard {
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.insert(id, observer);
        ObserverGuard {
            registry: Arc::downgrade(&self.inner.observers),
            id,
        }
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            sent: self.inner.sent.load(Ordering::Relaxed),
            received: self.inner.received.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            pending_calls: self.inner.table.pending_calls(),
            open_streams: self.inner.table.open_streams(),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// Shuts the endpoint down.
    ///
    /// New operations fail with `Disposed` from the moment this is called;
    /// every pending call and stream is rejected with `Disposed`; the
    /// transport is closed last.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let settled = self.inner.shutdown();
        self.inner.transport.close().await;
        info!(target: "bus", endpoint = %self.endpoint(), settled, "Message bus disposed");
    }
}
