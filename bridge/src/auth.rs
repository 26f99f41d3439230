// Token authentication for attaching endpoints
use std::collections::HashMap;
use std::sync::Arc;

use tonic::metadata::MetadataMap;
use tonic::service::Interceptor;
use tonic::{Request, Status};
use tracing::warn;

use crate::notice_codes;

/// Metadata key carrying the reject code on an unauthenticated status.
pub const REJECT_CODE_KEY: &str = "x-weave-reject-code";
/// Alternative to `authorization: Bearer <token>`.
pub const TOKEN_KEY: &str = "x-weave-token";

/// Authenticated identity, stored in request extensions for the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRejection {
    pub code: u32,
    pub reason: String,
}

impl AuthRejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            code: notice_codes::UNAUTHORIZED,
            reason: reason.into(),
        }
    }

    fn into_status(self) -> Status {
        let mut status = Status::unauthenticated(self.reason);
        if let Ok(code) = self.code.to_string().parse() {
            status.metadata_mut().insert(REJECT_CODE_KEY, code);
        }
        status
    }
}

/// Maps a presented token to an identity.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<String, AuthRejection>;
}

/// Static token table, typically loaded from `WEAVE_BRIDGE_TOKENS`.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl TokenAuthenticator {
    pub fn new<I, T, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = (T, S)>,
        T: Into<String>,
        S: Into<String>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(|(t, id)| (t.into(), id.into()))
                .collect(),
        }
    }

    /// Parses `token:identity` pairs separated by commas.
    pub fn parse(entries: &str) -> Result<Self, String> {
        let mut tokens = HashMap::new();
        for pair in entries.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match pair.split_once(':') {
                Some((token, identity)) if !token.is_empty() && !identity.is_empty() => {
                    tokens.insert(token.to_string(), identity.to_string());
                }
                _ => return Err(format!("malformed token entry: {pair}")),
            }
        }
        Ok(Self { tokens })
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: &str) -> Result<String, AuthRejection> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthRejection::new("invalid token"))
    }
}

/// Pulls a token from `authorization: Bearer ..` or `x-weave-token`.
pub fn presented_token(metadata: &MetadataMap) -> Option<String> {
    if let Some(value) = metadata.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }
    metadata
        .get(TOKEN_KEY)
        .and_then(|v| v.to_str().ok())
        .map(|t| t.trim().to_string())
}

/// Rejects unauthenticated attach calls; with no authenticator every call
/// passes anonymously.
#[derive(Clone)]
pub struct AuthInterceptor {
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl AuthInterceptor {
    pub fn new(authenticator: Option<Arc<dyn Authenticator>>) -> Self {
        Self { authenticator }
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        let Some(authenticator) = &self.authenticator else {
            return Ok(request);
        };
        let Some(token) = presented_token(request.metadata()) else {
            warn!(target: "bridge", "Attach rejected: missing token");
            return Err(AuthRejection::new("missing token").into_status());
        };
        match authenticator.authenticate(&token) {
            Ok(identity) => {
                request.extensions_mut().insert(Identity(identity));
                Ok(request)
            }
            Err(rejection) => {
                warn!(target: "bridge", reason = %rejection.reason, "Attach rejected");
                Err(rejection.into_status())
            }
        }
    }
}
