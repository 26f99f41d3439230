//! Correlation table: outstanding calls and streams, with timeouts.
//!
//! Every entry resolves at most once. Resolution, timeout and disposal all go
//! through `DashMap::remove`, so whichever path removes the entry first wins
//! and the others become no-ops.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::message::Message;
use crate::{MeshError, Result};

/// Callbacks for one open stream.
///
/// `on_chunk` may fire any number of times, then exactly one of `on_end` or
/// `on_error` fires. Callbacks run inline on the inbound path and must not
/// block.
pub trait StreamHandlers: Send + Sync {
    fn on_chunk(&self, chunk: Value);
    fn on_end(&self, payload: Value);
    fn on_error(&self, error: MeshError);
}

type ChunkFn = Box<dyn Fn(Value) + Send + Sync>;
type ErrorFn = Box<dyn Fn(MeshError) + Send + Sync>;

/// Closure-backed [`StreamHandlers`]; unset callbacks are no-ops.
#[derive(Default)]
pub struct StreamCallbacks {
    chunk: Option<ChunkFn>,
    end: Option<ChunkFn>,
    error: Option<ErrorFn>,
}

impl StreamCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_chunk(mut self, f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.chunk = Some(Box::new(f));
        self
    }

    pub fn on_end(mut self, f: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.end = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(MeshError) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }
}

impl StreamHandlers for StreamCallbacks {
    fn on_chunk(&self, chunk: Value) {
        if let Some(f) = &self.chunk {
            f(chunk);
        }
    }

    fn on_end(&self, payload: Value) {
        if let Some(f) = &self.end {
            f(payload);
        }
    }

    fn on_error(&self, error: MeshError) {
        if let Some(f) = &self.error {
            f(error);
        }
    }
}

/// Stream lifecycle event, as delivered through a [`StreamReceiver`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Chunk(Value),
    End(Value),
    Error(MeshError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Chunk(_))
    }
}

/// Forwards stream callbacks into a channel.
struct ChannelHandlers {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamHandlers for ChannelHandlers {
    fn on_chunk(&self, chunk: Value) {
        let _ = self.tx.send(StreamEvent::Chunk(chunk));
    }

    fn on_end(&self, payload: Value) {
        let _ = self.tx.send(StreamEvent::End(payload));
    }

    fn on_error(&self, error: MeshError) {
        let _ = self.tx.send(StreamEvent::Error(error));
    }
}

/// Receiving side of a channel-backed stream.
pub struct StreamReceiver {
    stream_id: String,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl StreamReceiver {
    pub fn channel(stream_id: impl Into<String>) -> (Arc<dyn StreamHandlers>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(ChannelHandlers { tx }),
            Self {
                stream_id: stream_id.into(),
                rx,
            },
        )
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Next event; `None` once the terminal event has been consumed.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        let event = self.rx.recv().await?;
        if event.is_terminal() {
            self.rx.close();
        }
        Some(event)
    }

    /// Drains the stream, returning its chunks or the terminal error.
    pub async fn collect(mut self) -> Result<Vec<Value>> {
        let mut chunks = Vec::new();
        while let Some(event) = self.recv().await {
            match event {
                StreamEvent::Chunk(v) => chunks.push(v),
                StreamEvent::End(_) => return Ok(chunks),
                StreamEvent::Error(e) => return Err(e),
            }
        }
        Err(MeshError::Disposed)
    }
}

struct PendingCall {
    created_at: Instant,
    tx: oneshot::Sender<Result<Value>>,
    timer: Option<JoinHandle<()>>,
}

struct SlotState {
    done: bool,
    last_activity: Instant,
}

struct StreamSlot {
    handlers: Arc<dyn StreamHandlers>,
    state: Mutex<SlotState>,
}

struct PendingStream {
    slot: Arc<StreamSlot>,
    watchdog: Option<JoinHandle<()>>,
}

/// Outstanding request→response pairs and open streams for one bus.
#[derive(Default)]
pub struct CorrelationTable {
    calls: DashMap<String, PendingCall>,
    streams: DashMap<String, PendingStream>,
    closed: AtomicBool,
}

impl CorrelationTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a pending call for `message_id` that times out after `timeout`.
    ///
    /// The returned future resolves with the response payload, the remote
    /// error, `Timeout`, or `Disposed`. Dropping it cancels the entry.
    pub fn await_response(
        self: &Arc<Self>,
        message_id: &str,
        timeout: Duration,
    ) -> Result<PendingResponse> {
        if self.is_closed() {
            return Err(MeshError::Disposed);
        }
        let (tx, rx) = oneshot::channel();
        match self.calls.entry(message_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(MeshError::Validation(format!(
                    "message id {message_id} is already awaiting a response"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(PendingCall {
                    created_at: Instant::now(),
                    tx,
                    timer: None,
                });
            }
        }

        let weak = Arc::downgrade(self);
        let id = message_id.to_string();
        let timeout_ms = timeout.as_millis() as u64;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(table) = weak.upgrade() {
                table.fail_call(&id, MeshError::Timeout(timeout_ms));
            }
        });
        match self.calls.get_mut(message_id) {
            Some(mut entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }

        Ok(PendingResponse {
            message_id: message_id.to_string(),
            rx,
            table: Arc::downgrade(self),
        })
    }

    /// Resolves the call a `response` message correlates to.
    ///
    /// Returns `false` for responses nobody is waiting on (late, unknown, or
    /// already timed out); those are dropped.
    pub fn resolve(&self, response: &Message) -> bool {
        let Some(id) = response.correlation_id.as_deref() else {
            return false;
        };
        let Some((_, call)) = self.calls.remove(id) else {
            debug!(target: "bus", correlation_id = %id, "Dropping response with no pending call");
            return false;
        };
        if let Some(timer) = call.timer {
            timer.abort();
        }
        let result = match &response.error {
            Some(err) => Err(MeshError::from_error_info(err, &response.payload)),
            None => Ok(response.payload.clone()),
        };
        debug!(target: "bus", correlation_id = %id, elapsed_ms = call.created_at.elapsed().as_millis() as u64, "Resolved pending call");
        let _ = call.tx.send(result);
        true
    }

    /// Rejects a pending call; no-op if it already settled.
    pub fn fail_call(&self, message_id: &str, error: MeshError) -> bool {
        let Some((_, call)) = self.calls.remove(message_id) else {
            return false;
        };
        if let Some(timer) = call.timer {
            timer.abort();
        }
        debug!(target: "bus", message_id = %message_id, error = %error, "Pending call failed");
        let _ = call.tx.send(Err(error));
        true
    }

    /// Opens a stream entry with an idle timeout that resets on every chunk.
    pub fn open_stream(
        self: &Arc<Self>,
        stream_id: &str,
        idle_timeout: Duration,
        handlers: Arc<dyn StreamHandlers>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(MeshError::Disposed);
        }
        let slot = Arc::new(StreamSlot {
            handlers,
            state: Mutex::new(SlotState {
                done: false,
                last_activity: Instant::now(),
            }),
        });

        match self.streams.entry(stream_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(MeshError::Validation(format!(
                    "stream id {stream_id} is already open"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(PendingStream {
                    slot: Arc::clone(&slot),
                    watchdog: None,
                });
            }
        }

        let weak = Arc::downgrade(self);
        let id = stream_id.to_string();
        let watchdog = tokio::spawn(Self::watch_idle(weak, id, slot, idle_timeout));
        match self.streams.get_mut(stream_id) {
            Some(mut entry) => entry.watchdog = Some(watchdog),
            None => watchdog.abort(),
        }
        Ok(())
    }

    async fn watch_idle(
        table: Weak<CorrelationTable>,
        stream_id: String,
        slot: Arc<StreamSlot>,
        idle_timeout: Duration,
    ) {
        loop {
            let deadline = slot.state.lock().last_activity + idle_timeout;
            tokio::time::sleep_until(deadline).await;
            let idle_for = slot.state.lock().last_activity.elapsed();
            if idle_for >= idle_timeout {
                if let Some(table) = table.upgrade() {
                    table.terminate_stream(
                        &stream_id,
                        Err(MeshError::Timeout(idle_timeout.as_millis() as u64)),
                    );
                }
                return;
            }
        }
    }

    /// Feeds a `stream_chunk` to its stream. Chunks for closed or unknown
    /// streams are dropped.
    pub fn push_chunk(&self, chunk: &Message) -> bool {
        let Some(id) = chunk.stream_id.as_deref() else {
            return false;
        };
        let Some(slot) = self.streams.get(id).map(|e| Arc::clone(&e.slot)) else {
            debug!(target: "bus", stream_id = %id, "Dropping chunk for closed stream");
            return false;
        };
        let mut state = slot.state.lock();
        if state.done {
            return false;
        }
        state.last_activity = Instant::now();
        slot.handlers.on_chunk(chunk.payload.clone());
        true
    }

    /// Handles `stream_end` / `stream_error` for the stream it names.
    pub fn finish_stream(&self, terminal: &Message) -> bool {
        let Some(id) = terminal.stream_id.as_deref() else {
            return false;
        };
        let outcome = match &terminal.error {
            Some(err) => Err(MeshError::from_error_info(err, &terminal.payload)),
            None => Ok(terminal.payload.clone()),
        };
        self.terminate_stream(id, outcome)
    }

    /// Settles a stream exactly once; later terminal events are ignored.
    pub fn terminate_stream(&self, stream_id: &str, outcome: Result<Value>) -> bool {
        let Some((_, pending)) = self.streams.remove(stream_id) else {
            return false;
        };
        if let Some(watchdog) = pending.watchdog {
            watchdog.abort();
        }
        {
            let mut state = pending.slot.state.lock();
            if state.done {
                return false;
            }
            state.done = true;
        }
        match outcome {
            Ok(payload) => pending.slot.handlers.on_end(payload),
            Err(err) => {
                debug!(target: "bus", stream_id = %stream_id, error = %err, "Stream failed");
                pending.slot.handlers.on_error(err)
            }
        }
        true
    }

    /// Rejects every outstanding call and stream with `error` and refuses new
    /// registrations. Returns how many entries were settled.
    pub fn close(&self, error: MeshError) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let mut settled = 0;

        let call_ids: Vec<String> = self.calls.iter().map(|e| e.key().clone()).collect();
        for id in call_ids {
            if self.fail_call(&id, error.clone()) {
                settled += 1;
            }
        }

        let stream_ids: Vec<String> = self.streams.iter().map(|e| e.key().clone()).collect();
        for id in stream_ids {
            if self.terminate_stream(&id, Err(error.clone())) {
                settled += 1;
            }
        }
        settled
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn is_pending(&self, message_id: &str) -> bool {
        self.calls.contains_key(message_id)
    }
}

/// Future returned by [`CorrelationTable::await_response`].
pub struct PendingResponse {
    message_id: String,
    rx: oneshot::Receiver<Result<Value>>,
    table: Weak<CorrelationTable>,
}

impl PendingResponse {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }
}

impl Future for PendingResponse {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without settling: only happens when the table is gone.
            Poll::Ready(Err(_)) => Poll::Ready(Err(MeshError::Disposed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            if let Some((_, call)) = table.calls.remove(&self.message_id) {
                if let Some(timer) = call.timer {
                    timer.abort();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use serde_json::json;

    fn response_to(id: &str, payload: Value) -> Message {
        let mut msg = Message::new(MessageType::Response, "b", "a", payload);
        msg.correlation_id = Some(id.to_string());
        msg
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_after_timeout_is_a_no_op() {
        let table = CorrelationTable::new();
        let pending = table
            .await_response("m1", Duration::from_millis(100))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(pending.await, Err(MeshError::Timeout(100)));
        assert!(!table.resolve(&response_to("m1", json!("late"))));
        assert_eq!(table.pending_calls(), 0);
    }

    #[tokio::test]
    async fn dropping_the_future_cancels_the_entry() {
        let table = CorrelationTable::new();
        let pending = table.await_response("m1", Duration::from_secs(5)).unwrap();
        assert!(table.is_pending("m1"));
        drop(pending);
        assert!(!table.is_pending("m1"));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_call_ids_leave_the_first_call_intact() {
        let table = CorrelationTable::new();
        let first = table
            .await_response("m1", Duration::from_millis(100))
            .unwrap();
        assert!(matches!(
            table.await_response("m1", Duration::from_secs(5)),
            Err(MeshError::Validation(_))
        ));

        assert!(table.resolve(&response_to("m1", json!("pong"))));
        assert_eq!(first.await, Ok(json!("pong")));
        assert_eq!(table.pending_calls(), 0);
    }

    #[tokio::test]
    async fn duplicate_stream_ids_are_refused_while_open() {
        let table = CorrelationTable::new();
        let (handlers, _rx) = StreamReceiver::channel("s1");
        table
            .open_stream("s1", Duration::from_secs(5), Arc::clone(&handlers))
            .unwrap();
        assert!(table
            .open_stream("s1", Duration::from_secs(5), handlers)
            .is_err());
    }
}
