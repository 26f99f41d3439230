//! Boundary validation for inbound messages.
//!
//! Every raw message is checked structurally (required fields, enum literal,
//! non-empty identifiers) and semantically (stream variants carry a
//! `streamId`, responses a `correlationId`, ...) before anything routes it.
//! Validation never fails loudly: it returns a result and bumps counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::message::{Message, MessageType};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Upper bound on the serialized size of `payload`.
    pub max_payload_bytes: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024,
        }
    }
}

/// A single failed check, addressed by field path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub path: String,
    pub reason: String,
}

impl ValidationIssue {
    fn new(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Key used in `ValidationStats.errors_by_key`.
    pub fn key(&self) -> String {
        format!("{}: {}", self.path, self.reason)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid message: {}", summarize(.issues))]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

fn summarize(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ValidationIssue::key)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ValidationStats {
    pub validated: u64,
    pub rejected: u64,
    pub errors_by_key: HashMap<String, u64>,
}

/// Message validator with process-local statistics.
///
/// Constructed explicitly and shared by reference; there is no global instance.
#[derive(Debug, Default)]
pub struct MessageValidator {
    config: ValidationConfig,
    validated: AtomicU64,
    rejected: AtomicU64,
    errors_by_key: DashMap<String, u64>,
}

impl MessageValidator {
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    /// Validates a raw JSON value and converts it into a [`Message`].
    pub fn validate(&self, raw: &Value) -> Result<Message, ValidationError> {
        let mut issues = Vec::new();

        let Some(obj) = raw.as_object() else {
            issues.push(ValidationIssue::new("$", "expected object"));
            return Err(self.reject(issues));
        };

        required_id(obj, "messageId", &mut issues);
        required_id(obj, "sourceWorker", &mut issues);
        required_id(obj, "targetWorker", &mut issues);
        optional_id(obj, "traceId", &mut issues);
        optional_id(obj, "streamId", &mut issues);
        optional_id(obj, "correlationId", &mut issues);

        let kind = match obj.get("type") {
            None => {
                issues.push(ValidationIssue::new("type", "required"));
                None
            }
            Some(Value::String(s)) => {
                let parsed = MessageType::parse(s);
                if parsed.is_none() {
                    issues.push(ValidationIssue::new("type", "invalid enum value"));
                }
                parsed
            }
            Some(_) => {
                issues.push(ValidationIssue::new("type", "expected string"));
                None
            }
        };

        match obj.get("payload") {
            None => issues.push(ValidationIssue::new("payload", "required")),
            Some(payload) => {
                // Serializing a Value cannot fail; size is measured on the wire form.
                let size = serde_json::to_vec(payload).map(|v| v.len()).unwrap_or(0);
                if size > self.config.max_payload_bytes {
                    issues.push(ValidationIssue::new("payload", "too large"));
                }
            }
        }

        if let Some(ts) = obj.get("timestamp") {
            if !ts.is_null() && ts.as_u64().is_none() {
                issues.push(ValidationIssue::new(
                    "timestamp",
                    "expected non-negative integer",
                ));
            }
        }

        if let Some(err) = obj.get("error") {
            check_error_shape(err, &mut issues);
        }

        if let Some(kind) = kind {
            let has = |field: &str| obj.get(field).is_some_and(|v| !v.is_null());
            if kind.is_stream() && !has("streamId") {
                issues.push(ValidationIssue::new(
                    "streamId",
                    format!("required for {kind}"),
                ));
            }
            if kind == MessageType::Response && !has("correlationId") {
                issues.push(ValidationIssue::new(
                    "correlationId",
                    "required for response",
                ));
            }
            if kind == MessageType::StreamError && !has("error") {
                issues.push(ValidationIssue::new("error", "required for stream_error"));
            }
        }

        if !issues.is_empty() {
            return Err(self.reject(issues));
        }

        match serde_json::from_value::<Message>(raw.clone()) {
            Ok(msg) => {
                self.validated.fetch_add(1, Ordering::Relaxed);
                Ok(msg)
            }
            Err(e) => Err(self.reject(vec![ValidationIssue::new("$", e.to_string())])),
        }
    }

    /// Parses and validates a JSON-encoded message.
    pub fn validate_bytes(&self, bytes: &[u8]) -> Result<Message, ValidationError> {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(raw) => self.validate(&raw),
            Err(_) => Err(self.reject(vec![ValidationIssue::new("$", "invalid JSON")])),
        }
    }

    /// Re-checks an already typed message, e.g. before it leaves this endpoint.
    pub fn validate_message(&self, msg: &Message) -> Result<Message, ValidationError> {
        match serde_json::to_value(msg) {
            Ok(raw) => self.validate(&raw),
            Err(e) => Err(self.reject(vec![ValidationIssue::new("$", e.to_string())])),
        }
    }

    pub fn stats(&self) -> ValidationStats {
        ValidationStats {
            validated: self.validated.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            errors_by_key: self
                .errors_by_key
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }

    pub fn reset_stats(&self) {
        self.validated.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
        self.errors_by_key.clear();
    }

    fn reject(&self, issues: Vec<ValidationIssue>) -> ValidationError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        for issue in &issues {
            *self.errors_by_key.entry(issue.key()).or_insert(0) += 1;
        }
        let err = ValidationError { issues };
        debug!(target: "validator", error = %err, "Rejected message");
        err
    }
}

fn required_id(obj: &Map<String, Value>, field: &str, issues: &mut Vec<ValidationIssue>) {
    match obj.get(field) {
        None | Some(Value::Null) => issues.push(ValidationIssue::new(field, "required")),
        Some(v) => check_id(field, v, issues),
    }
}

fn optional_id(obj: &Map<String, Value>, field: &str, issues: &mut Vec<ValidationIssue>) {
    match obj.get(field) {
        None | Some(Value::Null) => {}
        Some(v) => check_id(field, v, issues),
    }
}

fn check_id(field: &str, value: &Value, issues: &mut Vec<ValidationIssue>) {
    match value.as_str() {
        Some(s) if !s.trim().is_empty() => {}
        Some(_) => issues.push(ValidationIssue::new(field, "must not be empty")),
        None => issues.push(ValidationIssue::new(field, "expected string")),
    }
}

fn check_error_shape(err: &Value, issues: &mut Vec<ValidationIssue>) {
    if err.is_null() {
        return;
    }
    let Some(obj) = err.as_object() else {
        issues.push(ValidationIssue::new("error", "expected object"));
        return;
    };
    for field in ["name", "message"] {
        if !obj.get(field).is_some_and(Value::is_string) {
            issues.push(ValidationIssue::new(
                format!("error.{field}"),
                "expected string",
            ));
        }
    }
    if let Some(stack) = obj.get("stack") {
        if !stack.is_null() && !stack.is_string() {
            issues.push(ValidationIssue::new("error.stack", "expected string"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_key_joins_path_and_reason() {
        let issue = ValidationIssue::new("streamId", "required for stream_chunk");
        assert_eq!(issue.key(), "streamId: required for stream_chunk");
    }

    #[test]
    fn null_optional_fields_are_accepted() {
        let v = MessageValidator::default();
        let raw = json!({
            "messageId": "m1",
            "type": "broadcast",
            "sourceWorker": "a",
            "targetWorker": "*",
            "payload": null,
            "traceId": null,
        });
        assert!(v.validate(&raw).is_ok());
    }
}
