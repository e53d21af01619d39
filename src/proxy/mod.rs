//! MITM engine: transparent HTTP(S) interception under the sandbox CA.
//!
//! The userspace stack owns the guest-facing TCP; this module owns
//! everything above it: TLS termination with on-the-fly leaf minting,
//! policy enforcement, secret substitution, and upstream forwarding.

mod error;
mod http;
pub mod tls;

pub use error::ProxyError;
pub use http::Interceptor;
pub use tls::CertificateCache;
