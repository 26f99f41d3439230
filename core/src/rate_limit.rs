//! Sliding-window admission control keyed by opaque client identity.
//!
//! Each client keeps the timestamps of its admitted requests inside the
//! window. Reaching `max_requests` blocks the client for `block_duration_ms`,
//! which is independent of the window. Once the block expires the client
//! starts over with a clean slate.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error_names;
use crate::message::{ErrorInfo, Message, MessageType};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
    pub block_duration_ms: u64,
    pub sweep_interval_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_ms: 60_000,
            block_duration_ms: 300_000,
            sweep_interval_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl RateLimitDecision {
    fn allow(remaining: u32) -> Self {
        Self {
            allowed: true,
            remaining: Some(remaining),
            retry_after_seconds: None,
        }
    }

    fn deny(wait: Duration) -> Self {
        // Round up so a caller never retries a moment too early.
        let secs = wait.as_millis().div_ceil(1000).max(1) as u64;
        Self {
            allowed: false,
            remaining: Some(0),
            retry_after_seconds: Some(secs),
        }
    }
}

#[derive(Debug, Default)]
struct ClientWindow {
    requests: Vec<Instant>,
    blocked_until: Option<Instant>,
    violations: u32,
}

/// Picks the rate-limit key for a peer: the authenticated identity when
/// present, otherwise the fallback (endpoint name or peer address).
pub fn client_key<'a>(authenticated: Option<&'a str>, fallback: &'a str) -> &'a str {
    match authenticated {
        Some(id) if !id.is_empty() => id,
        _ => fallback,
    }
}

/// Explicit rejection for work denied by the limiter.
///
/// Requests get an error response and stream requests a `stream_error`, both
/// carrying `{"retryAfterSeconds": n}` as payload. Broadcasts have nobody
/// waiting on them, so they get `None`.
pub fn rejection(msg: &Message, retry_after_seconds: u64) -> Option<Message> {
    let error = ErrorInfo::new(
        error_names::RATE_LIMITED,
        format!("rate limit exceeded, retry after {retry_after_seconds}s"),
    );
    let body = json!({ "retryAfterSeconds": retry_after_seconds });
    match msg.kind {
        MessageType::Request => {
            let mut reply = msg.reply(Err(error));
            reply.payload = body;
            Some(reply)
        }
        MessageType::StreamRequest => Some(
            msg.stream_reply(MessageType::StreamError, body)
                .with_error(error),
        ),
        _ => None,
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    clients: DashMap<String, ClientWindow>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            clients: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn check(&self, client_id: &str) -> RateLimitDecision {
        self.check_at(client_id, Instant::now())
    }

    /// Admission decision for `client_id` at time `now`.
    pub fn check_at(&self, client_id: &str, now: Instant) -> RateLimitDecision {
        let window = Duration::from_millis(self.config.window_ms);
        let mut client = self.clients.entry(client_id.to_string()).or_default();

        if let Some(until) = client.blocked_until {
            if now < until {
                return RateLimitDecision::deny(until - now);
            }
            debug!(target: "rate_limit", client = %client_id, "Block expired");
            client.blocked_until = None;
            client.violations = 0;
            client.requests.clear();
        }

        client
            .requests
            .retain(|t| now.saturating_duration_since(*t) < window);

        if client.requests.len() as u32 >= self.config.max_requests {
            let block = Duration::from_millis(self.config.block_duration_ms);
            client.blocked_until = Some(now + block);
            client.violations += 1;
            warn!(target: "rate_limit", client = %client_id, violations = client.violations, "Rate limit exceeded, blocking client");
            return RateLimitDecision::deny(block);
        }

        client.requests.push(now);
        RateLimitDecision::allow(self.config.max_requests - client.requests.len() as u32)
    }

    pub fn is_blocked(&self, client_id: &str) -> bool {
        let now = Instant::now();
        self.clients
            .get(client_id)
            .and_then(|c| c.blocked_until)
            .is_some_and(|until| now < until)
    }

    pub fn violations(&self, client_id: &str) -> u32 {
        self.clients.get(client_id).map_or(0, |c| c.violations)
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    /// Drops state for one client.
    pub fn reset(&self, client_id: &str) {
        self.clients.remove(client_id);
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Evicts clients with no requests inside the window and no active block.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let window = Duration::from_millis(self.config.window_ms);
        let before = self.clients.len();
        self.clients.retain(|_, c| {
            let blocked = c.blocked_until.is_some_and(|until| now < until);
            let recent = c
                .requests
                .iter()
                .any(|t| now.saturating_duration_since(*t) < window);
            blocked || recent
        });
        let evicted = before.saturating_sub(self.clients.len());
        if evicted > 0 {
            debug!(target: "rate_limit", evicted, "Swept idle clients");
        }
        evicted
    }

    /// Runs [`sweep`](Self::sweep) every `sweep_interval_ms` until the
    /// returned handle is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let limiter = Arc::downgrade(self);
        let every = Duration::from_millis(self.config.sweep_interval_ms.max(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match limiter.upgrade() {
                    Some(limiter) => {
                        limiter.sweep();
                    }
                    None => return,
                }
            }
        });
        SweeperHandle { task }
    }
}

/// Aborts the sweep task on drop.
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticated_identity_wins_over_fallback() {
        assert_eq!(client_key(Some("user-7"), "10.0.0.1"), "user-7");
        assert_eq!(client_key(None, "10.0.0.1"), "10.0.0.1");
        assert_eq!(client_key(Some(""), "10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn rejection_matches_the_denied_work() {
        let req = Message::request("a", "b", serde_json::Value::Null);
        let reply = rejection(&req, 7).unwrap();
        assert_eq!(reply.kind, MessageType::Response);
        assert_eq!(reply.correlation_id.as_deref(), Some(req.message_id.as_str()));
        assert_eq!(reply.payload["retryAfterSeconds"], 7);

        let stream = Message::stream_request("a", "b", "s1", serde_json::Value::Null);
        let reply = rejection(&stream, 7).unwrap();
        assert_eq!(reply.kind, MessageType::StreamError);
        assert_eq!(reply.stream_id.as_deref(), Some("s1"));

        assert!(rejection(&Message::broadcast("a", serde_json::Value::Null), 7).is_none());
    }

    #[test]
    fn retry_after_rounds_up() {
        let d = RateLimitDecision::deny(Duration::from_millis(1_001));
        assert_eq!(d.retry_after_seconds, Some(2));
        let d = RateLimitDecision::deny(Duration::from_millis(10));
        assert_eq!(d.retry_after_seconds, Some(1));
    }
}
