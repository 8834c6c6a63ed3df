//! Backend target resolution.
//!
//! # Design Decisions
//! - Resolution is a pure function of the request; no shared mutable state
//! - `StaticBackend` keeps scheme and authority fixed and appends the
//!   request path to the configured base path

use std::fmt;

use axum::http::request::Parts;
use url::Url;

use crate::proxy::error::ProxyError;

/// A resolved backend WebSocket URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    url: Url,
}

impl ProxyEndpoint {
    /// Wrap a `ws`/`wss` URL.
    pub fn new(url: Url) -> Result<Self, ProxyError> {
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(ProxyError::Resolve(format!(
                "scheme `{other}` is not ws or wss"
            ))),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "wss"
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Maps an incoming upgrade request to the backend it should reach.
pub trait BackendResolver: Send + Sync + 'static {
    fn resolve(&self, request: &Parts) -> Result<ProxyEndpoint, ProxyError>;
}

impl<F> BackendResolver for F
where
    F: Fn(&Parts) -> Result<ProxyEndpoint, ProxyError> + Send + Sync + 'static,
{
    fn resolve(&self, request: &Parts) -> Result<ProxyEndpoint, ProxyError> {
        self(request)
    }
}

/// A single backend; the request path and query are carried over.
#[derive(Debug, Clone)]
pub struct StaticBackend {
    base: Url,
}

impl StaticBackend {
    pub fn new(base: Url) -> Result<Self, ProxyError> {
        ProxyEndpoint::new(base.clone())?;
        Ok(Self { base })
    }

    /// Parse `base` (e.g. "ws://127.0.0.1:9000/socket").
    pub fn parse(base: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(base).map_err(|e| ProxyError::Resolve(e.to_string()))?;
        Self::new(url)
    }
}

impl BackendResolver for StaticBackend {
    fn resolve(&self, request: &Parts) -> Result<ProxyEndpoint, ProxyError> {
        let mut url = self.base.clone();
        let prefix = self.base.path().trim_end_matches('/');
        let path = format!("{prefix}{}", request.uri.path());
        url.set_path(&path);
        url.set_query(request.uri.query());
        url.set_fragment(None);
        Ok(ProxyEndpoint { url })
    }
}
