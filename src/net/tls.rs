//! TLS listener support.

use std::path::Path;

use axum_server::tls_rustls::RustlsConfig;
use thiserror::Error;

use crate::config::TlsConfig;

/// Error type for listener setup.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// A certificate or key file is missing.
    #[error("{kind} file not found: {path}")]
    Missing { kind: &'static str, path: String },

    /// TLS serving was requested without a `[listener.tls]` section.
    #[error("no TLS certificate configured")]
    NotConfigured,

    /// The PEM material could not be loaded.
    #[error("failed to load TLS material: {0}")]
    Load(#[source] std::io::Error),

    /// The TLS listener failed while serving.
    #[error("TLS listener failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// Load the rustls server config for the listener.
pub async fn load_tls_config(tls: &TlsConfig) -> Result<RustlsConfig, ListenerError> {
    for (kind, path) in [("Certificate", &tls.cert_path), ("Private key", &tls.key_path)] {
        if !Path::new(path).exists() {
            return Err(ListenerError::Missing {
                kind,
                path: path.clone(),
            });
        }
    }

    RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
        .await
        .map_err(ListenerError::Load)
}
