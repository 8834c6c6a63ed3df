//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, sizes > 0, addresses parse)
//! - Check the backend URL is a WebSocket URL
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: Config → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;
use std::path::Path;

use thiserror::Error;
use url::Url;

use crate::config::schema::{Config, OriginCheck};

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("listener.bind_address `{0}` is not a socket address")]
    BindAddress(String),

    #[error("listener.path `{0}` must start with `/`")]
    Path(String),

    #[error("listener.max_sessions must be greater than zero")]
    MaxSessions,

    #[error("listener.tls file not found: {0}")]
    TlsFile(String),

    #[error("backend.url `{0}` is not a valid URL")]
    BackendUrl(String),

    #[error("backend.url scheme `{0}` is not ws or wss")]
    BackendScheme(String),

    #[error("proxy.{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("upgrader.{0} must be greater than zero")]
    ZeroBuffer(&'static str),

    #[error("upgrader.allowed_origins is empty but origin policy is allow-list")]
    EmptyAllowList,

    #[error("observability.metrics_address `{0}` is not a socket address")]
    MetricsAddress(String),
}

/// Validate a parsed configuration, collecting every error.
pub fn validate_config(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(config.listener.bind_address.clone()));
    }
    if !config.listener.path.starts_with('/') {
        errors.push(ValidationError::Path(config.listener.path.clone()));
    }
    if config.listener.max_sessions == 0 {
        errors.push(ValidationError::MaxSessions);
    }
    if let Some(tls) = &config.listener.tls {
        for file in [&tls.cert_path, &tls.key_path] {
            if !Path::new(file).exists() {
                errors.push(ValidationError::TlsFile(file.clone()));
            }
        }
    }

    match Url::parse(&config.backend.url) {
        Ok(url) if matches!(url.scheme(), "ws" | "wss") => {}
        Ok(url) => errors.push(ValidationError::BackendScheme(url.scheme().to_string())),
        Err(_) => errors.push(ValidationError::BackendUrl(config.backend.url.clone())),
    }

    if config.proxy.connect_timeout_ms == 0 {
        errors.push(ValidationError::ZeroTimeout("connect_timeout_ms"));
    }
    if config.proxy.close_timeout_ms == 0 {
        errors.push(ValidationError::ZeroTimeout("close_timeout_ms"));
    }

    if config.upgrader.read_buffer_size == 0 {
        errors.push(ValidationError::ZeroBuffer("read_buffer_size"));
    }
    if config.upgrader.write_buffer_size == 0 {
        errors.push(ValidationError::ZeroBuffer("write_buffer_size"));
    }
    if config.upgrader.origin == OriginCheck::AllowList && config.upgrader.allowed_origins.is_empty() {
        errors.push(ValidationError::EmptyAllowList);
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
