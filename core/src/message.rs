//! Wire-level message shapes shared by every endpoint.
//!
//! The JSON form (`messageId`, `sourceWorker`, ...) is the only contract
//! between isolated contexts; field names and the seven `type` literals must
//! stay stable across versions of either side.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `targetWorker` value meaning "every other endpoint".
pub const BROADCAST_TARGET: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    StreamRequest,
    StreamChunk,
    StreamEnd,
    StreamError,
    Broadcast,
}

impl MessageType {
    pub const ALL: [MessageType; 7] = [
        MessageType::Request,
        MessageType::Response,
        MessageType::StreamRequest,
        MessageType::StreamChunk,
        MessageType::StreamEnd,
        MessageType::StreamError,
        MessageType::Broadcast,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::StreamRequest => "stream_request",
            MessageType::StreamChunk => "stream_chunk",
            MessageType::StreamEnd => "stream_end",
            MessageType::StreamError => "stream_error",
            MessageType::Broadcast => "broadcast",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    pub fn is_stream(self) -> bool {
        matches!(
            self,
            MessageType::StreamRequest
                | MessageType::StreamChunk
                | MessageType::StreamEnd
                | MessageType::StreamError
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error carried by `response` and `stream_error` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorInfo {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }
}

/// The unit of communication between endpoints.
///
/// `payload` is opaque to the core: it is only size-checked by the validator
/// and never inspected by the router, apart from the optional `"op"` handler
/// key the bus reads on inbound requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub source_worker: String,
    pub target_worker: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Fresh globally unique identifier for messages and streams.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

impl Message {
    /// Creates a message with a fresh id and the current timestamp.
    pub fn new(
        kind: MessageType,
        source: impl Into<String>,
        target: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            message_id: new_id(),
            kind,
            source_worker: source.into(),
            target_worker: target.into(),
            payload,
            timestamp: Some(now_ms()),
            trace_id: None,
            stream_id: None,
            correlation_id: None,
            error: None,
        }
    }

    pub fn request(source: impl Into<String>, target: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageType::Request, source, target, payload)
    }

    pub fn broadcast(source: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageType::Broadcast, source, BROADCAST_TARGET, payload)
    }

    pub fn stream_request(
        source: impl Into<String>,
        target: impl Into<String>,
        stream_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self::new(MessageType::StreamRequest, source, target, payload).with_stream(stream_id)
    }

    /// Builds the reply to `self`, addressed back to its sender.
    ///
    /// The trace id is carried over so a whole logical operation stays linked.
    pub fn reply(&self, result: std::result::Result<Value, ErrorInfo>) -> Self {
        let mut reply = Self::new(
            MessageType::Response,
            self.target_worker.clone(),
            self.source_worker.clone(),
            Value::Null,
        );
        reply.correlation_id = Some(self.message_id.clone());
        reply.trace_id = self.trace_id.clone();
        match result {
            Ok(payload) => reply.payload = payload,
            Err(err) => reply.error = Some(err),
        }
        reply
    }

    /// Builds a stream-variant message answering the stream request `self`.
    pub fn stream_reply(&self, kind: MessageType, payload: Value) -> Self {
        let mut out = Self::new(
            kind,
            self.target_worker.clone(),
            self.source_worker.clone(),
            payload,
        );
        out.stream_id = self.stream_id.clone();
        out.trace_id = self.trace_id.clone();
        out
    }

    pub fn with_stream(mut self, stream_id: impl Into<String>) -> Self {
        self.stream_id = Some(stream_id.into());
        self
    }

    pub fn with_trace(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_error(mut self, error: ErrorInfo) -> Self {
        self.error = Some(error);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_worker == BROADCAST_TARGET
    }

    /// Handler name requested by this message's payload (`payload.op`).
    pub fn op(&self) -> Option<&str> {
        self.payload.get("op").and_then(Value::as_str)
    }

    pub fn to_json(&self) -> crate::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape_uses_camel_case_and_type_literal() {
        let msg = Message::request("a", "b", json!({ "op": "ping" })).with_trace("t-1");
        let wire = msg.to_json().unwrap();
        assert_eq!(wire["type"], "request");
        assert_eq!(wire["sourceWorker"], "a");
        assert_eq!(wire["targetWorker"], "b");
        assert_eq!(wire["traceId"], "t-1");
        assert!(wire.get("correlationId").is_none());
        assert!(wire.get("error").is_none());
    }

    #[test]
    fn reply_correlates_to_request() {
        let req = Message::request("a", "b", json!(1)).with_trace("trace");
        let resp = req.reply(Ok(json!("pong")));
        assert_eq!(resp.kind, MessageType::Response);
        assert_eq!(resp.correlation_id.as_deref(), Some(req.message_id.as_str()));
        assert_eq!(resp.source_worker, "b");
        assert_eq!(resp.target_worker, "a");
        assert_eq!(resp.trace_id.as_deref(), Some("trace"));
        assert_ne!(resp.message_id, req.message_id);
    }

    #[test]
    fn type_literals_parse_back() {
        for t in MessageType::ALL {
            assert_eq!(MessageType::parse(t.as_str()), Some(t));
        }
        assert_eq!(MessageType::parse("event"), None);
    }
}
