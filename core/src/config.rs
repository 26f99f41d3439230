use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bus::BusConfig;
use crate::rate_limit::RateLimitConfig;
use crate::transport::TransportConfig;
use crate::validator::ValidationConfig;
use crate::{MeshError, Result};

/// Environment variable naming the TOML config file.
pub const CONFIG_PATH_ENV: &str = "WEAVE_CONFIG";

/// Complete configuration for one process hosting endpoints.
///
/// Every section falls back to its defaults, so a TOML file only needs the
/// keys it changes:
///
/// ```toml
/// [bus]
/// default_timeout_ms = 5000
///
/// [bus.retry]
/// max_attempts = 5
///
/// [transport.when_disconnected]
/// mode = "queue"
/// capacity = 200
/// overflow = "reject_new"
///
/// [rate_limit]
/// max_requests = 50
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MeshConfig {
    pub bus: BusConfig,
    pub transport: TransportConfig,
    pub rate_limit: RateLimitConfig,
    pub validation: ValidationConfig,
}

impl MeshConfig {
    /// Load configuration from a TOML file (path via WEAVE_CONFIG or ./weave.toml),
    /// overlaying values onto defaults, then applying env overrides.
    pub fn load() -> Self {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "weave.toml".into());
        let p = Path::new(&path);
        let base = if !p.exists() {
            tracing::info!(target: "config", path = %path, "No TOML config found; using defaults/env");
            Self::default()
        } else {
            match Self::load_from(p) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!(target: "config", path = %path, error = %e, "Failed to load TOML; using defaults");
                    Self::default()
                }
            }
        };
        base.with_env_overrides()
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| MeshError::Config(e.to_string()))
    }

    /// Applies `WEAVE_*` environment overrides on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(v) = env_parse("WEAVE_REQUEST_TIMEOUT_MS") {
            self.bus.default_timeout_ms = v;
        }
        if let Some(v) = env_parse("WEAVE_STREAM_IDLE_TIMEOUT_MS") {
            self.bus.stream_idle_timeout_ms = v;
        }
        if let Some(v) = env_parse("WEAVE_RETRY_MAX_ATTEMPTS") {
            self.bus.retry.max_attempts = v;
        }
        if let Some(v) = env_parse("WEAVE_RETRY_BASE_DELAY_MS") {
            self.bus.retry.base_delay_ms = v;
        }
        if let Some(v) = env_parse("WEAVE_RATE_LIMIT_MAX") {
            self.rate_limit.max_requests = v;
        }
        if let Some(v) = env_parse("WEAVE_RATE_LIMIT_WINDOW_MS") {
            self.rate_limit.window_ms = v;
        }
        if let Some(v) = env_parse("WEAVE_RATE_LIMIT_BLOCK_MS") {
            self.rate_limit.block_duration_ms = v;
        }
        if let Some(v) = env_parse("WEAVE_MAX_PAYLOAD_BYTES") {
            self.validation.max_payload_bytes = v;
        }
        self
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|v| v.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::OverflowPolicy;
    use crate::transport::DisconnectedPolicy;

    #[test]
    fn partial_toml_overlays_defaults() {
        let cfg = MeshConfig::from_toml_str(
            r#"
            [bus]
            default_timeout_ms = 5000

            [bus.retry]
            max_attempts = 5

            [transport.when_disconnected]
            mode = "queue"
            capacity = 200
            overflow = "reject_new"

            [rate_limit]
            max_requests = 50
            "#,
        )
        .unwrap();

        assert_eq!(cfg.bus.default_timeout_ms, 5000);
        assert_eq!(cfg.bus.retry.max_attempts, 5);
        assert_eq!(cfg.bus.retry.base_delay_ms, 100);
        assert_eq!(
            cfg.transport.when_disconnected,
            DisconnectedPolicy::Queue {
                capacity: 200,
                overflow: OverflowPolicy::RejectNew
            }
        );
        assert_eq!(cfg.rate_limit.max_requests, 50);
        assert_eq!(cfg.rate_limit.window_ms, 60_000);
    }

    #[test]
    fn fail_fast_mode_parses() {
        let cfg = MeshConfig::from_toml_str(
            r#"
            [transport.when_disconnected]
            mode = "fail_fast"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.transport.when_disconnected, DisconnectedPolicy::FailFast);
        assert!(cfg.transport.build_queue().is_none());
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        let err = MeshConfig::from_toml_str("[bus\n").unwrap_err();
        assert!(matches!(err, MeshError::Config(_)));
    }
}
