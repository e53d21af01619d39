//! Interception-path integration tests.
//!
//! These drive the MITM engine over real Unix sockets the way the
//! userspace stack does, without a VM: a "guest" connects to the listener
//! sockets and speaks HTTP or TLS. Only denial paths are exercised here
//! (the allow path needs a live upstream); substitution and policy
//! internals are covered by unit tests.

use matchlock::api::NetworkConfig;
use matchlock::net::PolicyEngine;
use matchlock::proxy::Interceptor;
use matchlock::sandbox::ca::EphemeralCa;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

fn test_policy(allowed: &[&str]) -> Arc<PolicyEngine> {
    Arc::new(PolicyEngine::new(&NetworkConfig {
        allowed_hosts: allowed.iter().map(|s| s.to_string()).collect(),
        block_private_ips: true,
        secrets: HashMap::new(),
    }))
}

async fn spawn_interceptor(
    dir: &std::path::Path,
    allowed: &[&str],
) -> (std::path::PathBuf, std::path::PathBuf, watch::Sender<bool>) {
    let ca = Arc::new(EphemeralCa::generate(&dir.join("ca"), "vm-itest001").unwrap());
    let interceptor = Arc::new(Interceptor::new(test_policy(allowed), ca).unwrap());

    let http_path = dir.join("http.sock");
    let tls_path = dir.join("tls.sock");
    let http_listener = UnixListener::bind(&http_path).unwrap();
    let tls_listener = UnixListener::bind(&tls_path).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(interceptor.clone().serve_http(http_listener, shutdown_rx.clone()));
    tokio::spawn(interceptor.serve_tls(tls_listener, shutdown_rx));

    (http_path, tls_path, shutdown_tx)
}

#[tokio::test]
async fn http_request_to_denied_host_gets_403() {
    let dir = tempfile::tempdir().unwrap();
    let (http_path, _tls, _shutdown) = spawn_interceptor(dir.path(), &["example.com"]).await;

    let mut guest = UnixStream::connect(&http_path).await.unwrap();
    guest
        .write_all(b"GET /secret HTTP/1.1\r\nHost: blocked.test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    guest.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 403"), "got: {response}");
    assert!(response.contains("not-allowlisted"));
    assert!(response.contains("blocked.test"));
}

#[tokio::test]
async fn http_request_to_host_resolving_private_gets_403() {
    let dir = tempfile::tempdir().unwrap();
    // Allowlist matches everything; localhost still resolves to a private
    // address, so the private-IP rule must refuse the forward.
    let (http_path, _tls, _shutdown) = spawn_interceptor(dir.path(), &["*"]).await;

    let mut guest = UnixStream::connect(&http_path).await.unwrap();
    guest
        .write_all(b"GET /latest/meta-data HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    guest.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 403"), "got: {response}");
    assert!(response.contains("private-ip"));
}

#[tokio::test]
async fn http_request_without_host_gets_400() {
    let dir = tempfile::tempdir().unwrap();
    let (http_path, _tls, _shutdown) = spawn_interceptor(dir.path(), &["*"]).await;

    let mut guest = UnixStream::connect(&http_path).await.unwrap();
    guest
        .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    guest.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 400"), "got: {response}");
}

#[tokio::test]
async fn tls_handshake_to_denied_sni_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (_http, tls_path, _shutdown) = spawn_interceptor(dir.path(), &["example.com"]).await;

    // A denied SNI never completes the handshake, roots don't matter.
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));

    let stream = UnixStream::connect(&tls_path).await.unwrap();
    let name = rustls_pki_types::ServerName::try_from("blocked.test").unwrap();
    let result = connector.connect(name, stream).await;
    assert!(result.is_err(), "handshake to a denied SNI must fail");
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let dir = tempfile::tempdir().unwrap();
    let (http_path, _tls, shutdown) = spawn_interceptor(dir.path(), &["*"]).await;

    shutdown.send(true).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    // The listener socket file still exists but nobody serves it: a fresh
    // connection sees either a refused connect or an immediate EOF.
    match UnixStream::connect(&http_path).await {
        Err(_) => {}
        Ok(mut stream) => {
            stream
                .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
                .await
                .unwrap();
            let mut buf = [0u8; 16];
            match tokio::time::timeout(
                std::time::Duration::from_millis(500),
                stream.read(&mut buf),
            )
            .await
            {
                Err(_) | Ok(Err(_)) | Ok(Ok(0)) => {}
                Ok(Ok(_)) => panic!("interceptor answered after shutdown"),
            }
        }
    }
}
