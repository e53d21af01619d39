//! Error types for the MITM engine.
//!
//! Interception failures are recovered locally: a connection or request
//! fails but the sandbox lives. Policy denials are not errors at all; the
//! guest observes them through the proxied protocol (403, TLS alert,
//! NXDOMAIN).

use thiserror::Error;

/// Unified error type for interception operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("certificate error: {0}")]
    Certificate(#[from] crate::sandbox::ca::CaError),

    #[error("failed to reach upstream {addr}: {message}")]
    UpstreamConnect { addr: String, message: String },
}
