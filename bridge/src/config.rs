use std::net::SocketAddr;
use std::sync::Arc;

use weave_core::MeshConfig;

use crate::auth::{Authenticator, TokenAuthenticator};
use crate::{BridgeError, Result};

pub const ADDR_ENV: &str = "WEAVE_BRIDGE_ADDR";
pub const TOKENS_ENV: &str = "WEAVE_BRIDGE_TOKENS";
const DEFAULT_ADDR: &str = "0.0.0.0:50051";

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub addr: SocketAddr,
    /// `token:identity` pairs; empty means anonymous endpoints are accepted.
    pub tokens: Option<String>,
    /// Rate limiting and validation settings shared with in-process buses.
    pub mesh: MeshConfig,
}

impl BridgeConfig {
    /// Reads `.env` (if present), then `WEAVE_BRIDGE_*` and the mesh config.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let addr = std::env::var(ADDR_ENV)
            .unwrap_or_else(|_| DEFAULT_ADDR.into())
            .parse::<SocketAddr>()
            .map_err(|e| BridgeError::Config(format!("{ADDR_ENV}: {e}")))?;
        let tokens = std::env::var(TOKENS_ENV).ok().filter(|t| !t.trim().is_empty());
        Ok(Self {
            addr,
            tokens,
            mesh: MeshConfig::load(),
        })
    }

    pub fn authenticator(&self) -> Result<Option<Arc<dyn Authenticator>>> {
        let Some(entries) = &self.tokens else {
            return Ok(None);
        };
        let auth = TokenAuthenticator::parse(entries).map_err(BridgeError::Config)?;
        if auth.is_empty() {
            return Ok(None);
        }
        Ok(Some(Arc::new(auth)))
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 50051)),
            tokens: None,
            mesh: MeshConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_build_an_authenticator() {
        let config = BridgeConfig {
            tokens: Some("t1:planner".into()),
            ..BridgeConfig::default()
        };
        let auth = config.authenticator().unwrap().unwrap();
        assert_eq!(auth.authenticate("t1"), Ok("planner".to_string()));
    }

    #[test]
    fn no_tokens_means_no_authenticator() {
        assert!(BridgeConfig::default().authenticator().unwrap().is_none());
    }

    #[test]
    fn malformed_tokens_are_a_config_error() {
        let config = BridgeConfig {
            tokens: Some("nocolon".into()),
            ..BridgeConfig::default()
        };
        assert!(matches!(config.authenticator(), Err(BridgeError::Config(_))));
    }
}
