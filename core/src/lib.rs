// Weave Core Library
// Inter-agent communication substrate: validation, routing, correlation,
// streaming, admission control and retry discipline.

pub mod bus;
pub mod config;
pub mod correlation;
pub mod message;
pub mod metrics;
pub mod queue;
pub mod rate_limit;
pub mod retry;
pub mod router;
pub mod telemetry;
pub mod transport;
pub mod validator;

// Export core types
pub use bus::{
    handler_fn, stream_handler_fn, BusConfig, BusEvent, BusObserver, BusStats, MessageBus,
    MessageBusBuilder, ObserverGuard, RequestContext, RequestHandler, StreamHandler, StreamSink,
};
pub use config::MeshConfig;
pub use correlation::{
    CorrelationTable, StreamCallbacks, StreamEvent, StreamHandlers, StreamReceiver,
};
pub use message::{ErrorInfo, Message, MessageType, BROADCAST_TARGET};
pub use metrics::{MetricsCollector, SystemStats};
pub use queue::{MemoryQueue, OfflineQueue, OverflowPolicy};
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter};
pub use retry::{Attempt, RetryOutcome, RetryPolicy};
pub use router::{MessageRouter, RouteKind};
pub use transport::{
    ConnectionState, DisconnectedPolicy, Inbound, LocalHub, LocalTransport, Transport,
    TransportConfig,
};
pub use validator::{MessageValidator, ValidationConfig, ValidationError, ValidationStats};

use thiserror::Error;

/// Error names carried in `ErrorInfo.name` for failures the bus itself reports.
pub mod error_names {
    pub const VALIDATION: &str = "ValidationError";
    pub const TIMEOUT: &str = "Timeout";
    pub const TRANSPORT: &str = "TransportError";
    pub const RATE_LIMITED: &str = "RateLimitExceeded";
    pub const DISPOSED: &str = "DisposedError";
    pub const NO_HANDLER: &str = "NoHandler";
    pub const FALLBACK: &str = "FallbackRequired";
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MeshError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("{name}: {message}")]
    Remote {
        name: String,
        message: String,
        stack: Option<String>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Rate limit exceeded, retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("Bus disposed")]
    Disposed,

    #[error("Fallback required: {0}")]
    FallbackRequired(String),

    #[error("No handler registered for {0}")]
    NoHandler(String),

    #[error("Outbound queue full")]
    QueueFull,

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::Io(err.to_string())
    }
}

impl From<ValidationError> for MeshError {
    fn from(err: ValidationError) -> Self {
        MeshError::Validation(err.to_string())
    }
}

/// How the retry primitive should treat a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retry,
    Fallback,
    Fail,
}

impl MeshError {
    /// Only transient transport failures are retried; everything else is either
    /// handed back to the caller's fallback policy or surfaced as-is.
    pub fn disposition(&self) -> Disposition {
        match self {
            MeshError::Transport(_) => Disposition::Retry,
            MeshError::FallbackRequired(_) => Disposition::Fallback,
            _ => Disposition::Fail,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == Disposition::Retry
    }

    /// Short stable label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            MeshError::Validation(_) => "validation",
            MeshError::Timeout(_) => "timeout",
            MeshError::Remote { .. } => "remote",
            MeshError::Transport(_) => "transport",
            MeshError::RateLimited { .. } => "rate_limited",
            MeshError::Disposed => "disposed",
            MeshError::FallbackRequired(_) => "fallback_required",
            MeshError::NoHandler(_) => "no_handler",
            MeshError::QueueFull => "queue_full",
            MeshError::Config(_) => "config",
            MeshError::Serialization(_) => "serialization",
            MeshError::Io(_) => "io",
        }
    }

    /// Wire representation placed in `response.error` / `stream_error.error`.
    pub fn to_error_info(&self) -> ErrorInfo {
        match self {
            MeshError::Remote {
                name,
                message,
                stack,
            } => ErrorInfo {
                name: name.clone(),
                message: message.clone(),
                stack: stack.clone(),
            },
            MeshError::Validation(msg) => ErrorInfo::new(error_names::VALIDATION, msg.clone()),
            MeshError::Timeout(_) => ErrorInfo::new(error_names::TIMEOUT, self.to_string()),
            MeshError::Transport(msg) => ErrorInfo::new(error_names::TRANSPORT, msg.clone()),
            MeshError::RateLimited { .. } => {
                ErrorInfo::new(error_names::RATE_LIMITED, self.to_string())
            }
            MeshError::Disposed => ErrorInfo::new(error_names::DISPOSED, self.to_string()),
            MeshError::NoHandler(_) => ErrorInfo::new(error_names::NO_HANDLER, self.to_string()),
            MeshError::FallbackRequired(kind) => {
                ErrorInfo::new(error_names::FALLBACK, kind.clone())
            }
            other => ErrorInfo::new("Error", other.to_string()),
        }
    }

    /// Rebuilds a local error from a remote `ErrorInfo`, keeping name and message.
    ///
    /// `payload` is the body that travelled with the error; a rate-limit
    /// rejection carries `retryAfterSeconds` there.
    pub fn from_error_info(info: &ErrorInfo, payload: &serde_json::Value) -> Self {
        if info.name == error_names::RATE_LIMITED {
            if let Some(secs) = payload.get("retryAfterSeconds").and_then(|v| v.as_u64()) {
                return MeshError::RateLimited {
                    retry_after_seconds: secs,
                };
            }
        }
        MeshError::Remote {
            name: info.name.clone(),
            message: info.message.clone(),
            stack: info.stack.clone(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_transport_errors_are_retryable() {
        assert!(MeshError::Transport("reset".into()).is_retryable());
        assert!(!MeshError::Timeout(10).is_retryable());
        assert!(!MeshError::Validation("bad".into()).is_retryable());
        assert_eq!(
            MeshError::FallbackRequired("gpu".into()).disposition(),
            Disposition::Fallback
        );
    }

    #[test]
    fn remote_error_keeps_name_and_message() {
        let info = ErrorInfo {
            name: "TypeError".into(),
            message: "x is undefined".into(),
            stack: Some("at handler".into()),
        };
        let err = MeshError::from_error_info(&info, &serde_json::Value::Null);
        assert_eq!(err.to_error_info(), info);
    }

    #[test]
    fn rate_limit_rejection_is_recovered_from_payload() {
        let info = ErrorInfo::new(error_names::RATE_LIMITED, "slow down");
        let err = MeshError::from_error_info(&info, &json!({ "retryAfterSeconds": 42 }));
        assert_eq!(
            err,
            MeshError::RateLimited {
                retry_after_seconds: 42
            }
        );
    }
}
