//! Transparent HTTP(S) interception with secret substitution.
//!
//! The userspace stack splices guest port-80 flows into the HTTP listener
//! and guest port-443 flows into the TLS listener (both Unix sockets under
//! the sandbox state dir). Each flow walks the same state machine:
//!
//! ```text
//! peek (Host header | SNI) -> policy -> deny | upstream dial -> forward -> close
//! ```
//!
//! Denials never surface as errors; the guest sees a `403` with a
//! machine-readable body on HTTP, or a fatal TLS alert on HTTPS. On the
//! allow path every request header is run through the sandbox's secret
//! substitution table before the bytes leave the host, so placeholders are
//! rewritten to real values exactly once and only toward hosts the secret
//! is scoped to.

use super::error::ProxyError;
use super::tls::{self, CertificateCache};
use crate::net::policy::{is_private, PolicyEngine, Verdict, VerdictReason};
use crate::sandbox::ca::EphemeralCa;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpStream, UnixListener};
use tokio::sync::watch;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

/// Header-section cap; anything larger is treated as a denial-by-parse-error.
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// The MITM engine shared by both listeners.
pub struct Interceptor {
    policy: Arc<PolicyEngine>,
    certs: Arc<CertificateCache>,
    connector: tokio_rustls::TlsConnector,
}

impl Interceptor {
    pub fn new(policy: Arc<PolicyEngine>, ca: Arc<EphemeralCa>) -> Result<Self, ProxyError> {
        Ok(Self {
            policy,
            certs: Arc::new(CertificateCache::new(ca)),
            connector: tls::upstream_connector()?,
        })
    }

    pub fn cert_cache(&self) -> Arc<CertificateCache> {
        self.certs.clone()
    }

    /// Accept loop for plain HTTP flows (guest port 80).
    pub async fn serve_http(
        self: Arc<Self>,
        listener: UnixListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let interceptor = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = interceptor.handle_plain(stream).await {
                                    debug!("http interception ended: {e}");
                                }
                            });
                        }
                        Err(e) => warn!("http listener accept failed: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// Accept loop for TLS flows (guest port 443).
    pub async fn serve_tls(
        self: Arc<Self>,
        listener: UnixListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let interceptor = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = interceptor.handle_tls(stream).await {
                                    debug!("tls interception ended: {e}");
                                }
                            });
                        }
                        Err(e) => warn!("tls listener accept failed: {e}"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn handle_plain(self: Arc<Self>, stream: tokio::net::UnixStream) -> Result<(), ProxyError> {
        let interceptor = self.clone();
        let verdicts = Arc::new(ConnectionVerdicts::new(self.policy.clone()));
        let service = service_fn(move |req: Request<Incoming>| {
            let interceptor = interceptor.clone();
            let verdicts = verdicts.clone();
            async move { interceptor.intercept(req, None, verdicts).await }
        });

        hyper::server::conn::http1::Builder::new()
            .max_buf_size(MAX_HEADER_BYTES)
            .preserve_header_case(true)
            .serve_connection(TokioIo::new(stream), service)
            .await
            .map_err(ProxyError::from)
    }

    async fn handle_tls(self: Arc<Self>, stream: tokio::net::UnixStream) -> Result<(), ProxyError> {
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
        let start = acceptor
            .await
            .map_err(|e| ProxyError::Tls(format!("ClientHello read failed: {e}")))?;

        let Some(sni) = start.client_hello().server_name().map(str::to_string) else {
            debug!("dropping TLS flow without SNI");
            return Ok(());
        };

        let verdict = self.policy.evaluate(&sni, None);
        if !verdict.allow {
            info!(host = %sni, reason = verdict.reason.as_str(), "TLS connection denied");
            // A config with no certificate makes the handshake fail with a
            // fatal alert, which is the refusal the guest observes.
            let _ = start.into_stream(tls::refusal_config()).await;
            return Ok(());
        }

        let config = tls::server_config_for(&self.certs, &sni)?;
        let tls_stream = start
            .into_stream(config)
            .await
            .map_err(|e| ProxyError::Tls(format!("guest handshake failed: {e}")))?;

        // The SNI-time verdict covers every request on this connection.
        let interceptor = self.clone();
        let verdicts = Arc::new(ConnectionVerdicts::seeded(
            self.policy.clone(),
            &sni,
            verdict,
        ));
        let sni_for_service = sni.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let interceptor = interceptor.clone();
            let verdicts = verdicts.clone();
            let sni = sni_for_service.clone();
            async move { interceptor.intercept(req, Some(sni), verdicts).await }
        });

        hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(tls_stream), service)
            .await
            .map_err(|e| ProxyError::Tls(format!("intercepted session failed: {e}")))
    }

    /// Policy-check and forward one request. `sni` is set on the TLS path
    /// and pins the effective host; plain HTTP derives it per request.
    async fn intercept(
        &self,
        req: Request<Incoming>,
        sni: Option<String>,
        verdicts: Arc<ConnectionVerdicts>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
        let https = sni.is_some();
        let host = match sni {
            Some(sni) => sni,
            None => match effective_host(&req) {
                Some(host) => host,
                None => {
                    return Ok(error_response(
                        StatusCode::BAD_REQUEST,
                        "missing-host",
                        "request carries no Host header or authority",
                    ))
                }
            },
        };

        let verdict = verdicts.verdict(&host);
        if !verdict.allow {
            info!(host = %host, reason = verdict.reason.as_str(), "request denied");
            return Ok(error_response(
                StatusCode::FORBIDDEN,
                verdict.reason.as_str(),
                &format!("host {host:?} is not allowed by sandbox policy"),
            ));
        }

        // The allowlist matched on the name; the private-IP rule applies to
        // the addresses the name actually resolves to, per request, so a
        // record changing under us (DNS rebinding) is still caught here.
        let port = if https { 443 } else { 80 };
        let addrs = match resolve_upstream(&host, port).await {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!(host = %host, "upstream resolution failed: {e}");
                return Ok(error_response(
                    StatusCode::BAD_GATEWAY,
                    "upstream-failed",
                    &e.to_string(),
                ));
            }
        };
        if self.policy.block_private_ips() {
            if let Some(addr) = addrs.iter().find(|addr| is_private(addr.ip())) {
                info!(
                    host = %host,
                    addr = %addr.ip(),
                    reason = VerdictReason::PrivateIp.as_str(),
                    "request denied"
                );
                return Ok(error_response(
                    StatusCode::FORBIDDEN,
                    VerdictReason::PrivateIp.as_str(),
                    &format!("host {host:?} resolves to a private address"),
                ));
            }
        }

        debug!(host = %host, https, "forwarding request");
        match self.forward(req, &host, &addrs, https, &verdict).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(host = %host, "upstream request failed: {e}");
                Ok(error_response(
                    StatusCode::BAD_GATEWAY,
                    "upstream-failed",
                    &e.to_string(),
                ))
            }
        }
    }

    /// Dial one of the pre-screened upstream addresses and replay the
    /// request with substituted headers.
    async fn forward(
        &self,
        req: Request<Incoming>,
        host: &str,
        addrs: &[SocketAddr],
        https: bool,
        verdict: &Verdict,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
        let mut tcp = None;
        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect(*addr).await {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }
        let tcp = tcp.ok_or_else(|| ProxyError::UpstreamConnect {
            addr: format!("{host}:{}", if https { 443 } else { 80 }),
            message: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses".to_string()),
        })?;

        let upstream_req = build_upstream_request(req, host, verdict)?;

        let response = if https {
            let name = tls::server_name(host)?;
            let tls_stream = self
                .connector
                .connect(name, tcp)
                .await
                .map_err(|e| ProxyError::Tls(format!("upstream handshake failed: {e}")))?;
            send_over(TokioIo::new(tls_stream), upstream_req).await?
        } else {
            send_over(TokioIo::new(tcp), upstream_req).await?
        };

        Ok(response.map(|body| body.boxed()))
    }
}

/// Policy verdicts cached for the life of one guest connection, never
/// shared across connections. The TLS path seeds the cache with the
/// verdict computed at SNI time; the plain path fills it per host on
/// first use, so a keep-alive connection evaluates each host once.
struct ConnectionVerdicts {
    policy: Arc<PolicyEngine>,
    cache: Mutex<HashMap<String, Verdict>>,
}

impl ConnectionVerdicts {
    fn new(policy: Arc<PolicyEngine>) -> Self {
        Self {
            policy,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn seeded(policy: Arc<PolicyEngine>, host: &str, verdict: Verdict) -> Self {
        let verdicts = Self::new(policy);
        verdicts
            .cache
            .lock()
            .unwrap()
            .insert(host.to_lowercase(), verdict);
        verdicts
    }

    fn verdict(&self, host: &str) -> Verdict {
        let key = host.to_lowercase();
        if let Some(verdict) = self.cache.lock().unwrap().get(&key) {
            return verdict.clone();
        }
        let verdict = self.policy.evaluate(&key, None);
        self.cache
            .lock()
            .unwrap()
            .insert(key, verdict.clone());
        verdict
    }
}

/// Resolve the effective host to its candidate upstream addresses.
async fn resolve_upstream(host: &str, port: u16) -> Result<Vec<SocketAddr>, ProxyError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: format!("{host}:{port}"),
            message: e.to_string(),
        })?
        .collect();
    if addrs.is_empty() {
        return Err(ProxyError::UpstreamConnect {
            addr: format!("{host}:{port}"),
            message: "name resolved to no addresses".to_string(),
        });
    }
    Ok(addrs)
}

/// Issue one request over a fresh HTTP/1.1 upstream connection.
async fn send_over<IO>(
    io: IO,
    req: Request<Incoming>,
) -> Result<Response<Incoming>, ProxyError>
where
    IO: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("upstream connection closed: {e}");
        }
    });
    sender.send_request(req).await.map_err(ProxyError::from)
}

/// Rewrite a guest request for upstream transmission: origin-form URI,
/// explicit Host header, hop-by-hop headers dropped, placeholders
/// substituted.
fn build_upstream_request(
    req: Request<Incoming>,
    host: &str,
    verdict: &Verdict,
) -> Result<Request<Incoming>, ProxyError> {
    let (parts, body) = req.into_parts();

    let origin_form: Uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .parse()
        .map_err(|e| ProxyError::BadRequest(format!("bad request path: {e}")))?;

    let mut builder = Request::builder().method(parts.method).uri(origin_form);

    let mut saw_host = false;
    for (name, value) in &parts.headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        if *name == HOST {
            saw_host = true;
        }
        builder = builder.header(name, substitute_header(value, verdict));
    }
    if !saw_host {
        builder = builder.header(HOST, host);
    }

    builder
        .body(body)
        .map_err(|e| ProxyError::BadRequest(e.to_string()))
}

/// Replace each secret placeholder occurring in a header value.
///
/// A value that equals a placeholder is rewritten to the secret value exactly
/// once; values without placeholders pass through untouched.
fn substitute_header(value: &HeaderValue, verdict: &Verdict) -> HeaderValue {
    let Ok(text) = value.to_str() else {
        return value.clone();
    };
    let mut rewritten = text.to_string();
    let mut changed = false;
    for (placeholder, secret_value) in &verdict.substitutions {
        if rewritten.contains(placeholder.as_str()) {
            rewritten = rewritten.replace(placeholder.as_str(), secret_value);
            changed = true;
        }
    }
    if !changed {
        return value.clone();
    }
    HeaderValue::from_str(&rewritten).unwrap_or_else(|_| value.clone())
}

/// Effective host of a plain-HTTP request: URI authority first (absolute
/// form), then the Host header, with any port stripped.
fn effective_host(req: &Request<Incoming>) -> Option<String> {
    if let Some(host) = req.uri().host() {
        return Some(host.to_string());
    }
    let raw = req.headers().get(HOST)?.to_str().ok()?;
    Some(strip_port(raw).to_string())
}

fn strip_port(authority: &str) -> &str {
    if let Some(end) = authority.rfind(']') {
        // [::1]:443 keeps the bracketed address intact.
        return &authority[..=end];
    }
    authority.split(':').next().unwrap_or(authority)
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "proxy-connection"
            | "keep-alive"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Machine-readable denial/error body.
fn error_response(
    status: StatusCode,
    reason: &str,
    message: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::json!({
        "error": message,
        "reason": reason,
    })
    .to_string();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .unwrap()
}
