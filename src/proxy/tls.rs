//! TLS plumbing for the MITM engine.
//!
//! This module provides:
//! - A leaf-certificate cache keyed by SAN set, minting under the sandbox CA
//! - Per-SNI rustls `ServerConfig` construction for the guest-facing side
//! - A TLS connector for upstream connections, validated against the host's
//!   system trust store
//!
//! # ALPN
//!
//! The guest-facing config advertises `h2` and `http/1.1`; requests are
//! re-issued upstream over HTTP/1.1 regardless of what the guest negotiated,
//! so header substitution sees every request uniformly.

use super::error::ProxyError;
use crate::sandbox::ca::EphemeralCa;
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

/// Leaf certificates minted under the sandbox CA, cached by SAN set.
///
/// Readers take the lock only long enough to clone an `Arc`; minting happens
/// outside the lock and the first writer wins on a race.
pub struct CertificateCache {
    cache: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    ca: Arc<EphemeralCa>,
}

impl CertificateCache {
    pub fn new(ca: Arc<EphemeralCa>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ca,
        }
    }

    /// Get or mint the certified key for a SAN set.
    pub fn get_or_issue(&self, sans: &[&str]) -> Result<Arc<CertifiedKey>, ProxyError> {
        let key = {
            let mut sorted: Vec<String> = sans.iter().map(|s| s.to_lowercase()).collect();
            sorted.sort();
            sorted.join(",")
        };

        {
            let cache = self.cache.read().unwrap();
            if let Some(entry) = cache.get(&key) {
                trace!(sans = %key, "leaf cache hit");
                return Ok(entry.clone());
            }
        }

        debug!(sans = %key, "minting leaf certificate");
        let leaf = self.ca.issue_leaf(sans)?;

        let cert_chain: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut leaf.cert_pem.as_bytes())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ProxyError::Tls(format!("failed to parse leaf PEM: {e}")))?;
        if cert_chain.is_empty() {
            return Err(ProxyError::Tls("no certificate in minted PEM".into()));
        }

        let private_key: PrivateKeyDer<'static> =
            rustls_pemfile::private_key(&mut leaf.key_pem.as_bytes())
                .map_err(|e| ProxyError::Tls(format!("failed to parse leaf key: {e}")))?
                .ok_or_else(|| ProxyError::Tls("no private key in minted PEM".into()))?;

        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
            .map_err(|e| ProxyError::Tls(format!("unusable leaf key: {e}")))?;

        let certified = Arc::new(CertifiedKey::new(cert_chain, signing_key));

        let mut cache = self.cache.write().unwrap();
        Ok(cache.entry(key).or_insert(certified).clone())
    }

    pub fn len(&self) -> usize {
        self.cache.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().unwrap().is_empty()
    }
}

/// Resolver that always presents one pre-minted key.
///
/// Used with the lazy acceptor: the SNI is known (and policy-checked) before
/// the `ServerConfig` is built, so no per-handshake lookup is needed.
#[derive(Debug)]
struct FixedCertResolver(Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCertResolver {
    fn resolve(
        &self,
        _client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Build the guest-facing `ServerConfig` presenting a leaf for `sni`.
pub fn server_config_for(
    cache: &CertificateCache,
    sni: &str,
) -> Result<Arc<ServerConfig>, ProxyError> {
    let key = cache.get_or_issue(&[sni])?;
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCertResolver(key)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// A guest-facing config with no certificate: completing a handshake against
/// it makes rustls emit a fatal alert, which is how denied SNIs are refused.
pub fn refusal_config() -> Arc<ServerConfig> {
    #[derive(Debug)]
    struct RefuseAll;
    impl ResolvesServerCert for RefuseAll {
        fn resolve(
            &self,
            _client_hello: rustls::server::ClientHello<'_>,
        ) -> Option<Arc<CertifiedKey>> {
            None
        }
    }
    Arc::new(
        ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(RefuseAll)),
    )
}

/// TLS connector for upstream connections, rooted in the system trust store.
pub fn upstream_connector() -> Result<TlsConnector, ProxyError> {
    let mut root_store = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for err in native.errors {
        debug!("native cert load warning: {err}");
    }
    for cert in native.certs {
        let _ = root_store.add(cert);
    }
    if root_store.is_empty() {
        return Err(ProxyError::Tls("no system root certificates found".into()));
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Convert a host name into a rustls `ServerName`.
pub fn server_name(host: &str) -> Result<ServerName<'static>, ProxyError> {
    ServerName::try_from(host.to_string())
        .map_err(|_| ProxyError::Tls(format!("invalid server name {host:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cache() -> (tempfile::TempDir, CertificateCache) {
        let dir = tempfile::tempdir().unwrap();
        let ca = Arc::new(EphemeralCa::generate(&dir.path().join("ca"), "vm-tls00001").unwrap());
        (dir, CertificateCache::new(ca))
    }

    #[test]
    fn test_leaf_cached_per_san_set() {
        let (_dir, cache) = test_cache();
        assert!(cache.is_empty());

        let a = cache.get_or_issue(&["example.com"]).unwrap();
        let b = cache.get_or_issue(&["example.com"]).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(Arc::ptr_eq(&a, &b));

        cache.get_or_issue(&["other.com"]).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_key_case_and_order_insensitive() {
        let (_dir, cache) = test_cache();
        cache.get_or_issue(&["b.com", "A.com"]).unwrap();
        cache.get_or_issue(&["a.com", "B.com"]).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_server_config_builds() {
        let (_dir, cache) = test_cache();
        let config = server_config_for(&cache, "api.example.com").unwrap();
        assert!(config.alpn_protocols.contains(&b"http/1.1".to_vec()));
    }

    #[test]
    fn test_server_name_conversion() {
        assert!(server_name("example.com").is_ok());
        assert!(server_name("").is_err());
    }
}
