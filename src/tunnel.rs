//! Raw tunnels for SPDY/3.1 upgrade requests
//!
//! The upgrade is negotiated with the upstream over a dedicated connection
//! by replaying the client's request, then bytes are copied both ways
//! between the two upgraded connections until the upstream side closes.

use crate::cors::strip_upstream_cors;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::stats::ProxyStats;
use crate::upstream::{client_tls_config, join_uri};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST, UPGRADE};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::io;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

/// Upgrade protocol handled by the tunnel
pub const STREAM_PROTOCOL: &str = "SPDY/3.1";

/// Upper bound on the upstream's upgrade response head
const MAX_RESPONSE_HEAD: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("invalid upstream address: {0}")]
    InvalidUpstream(String),

    #[error("failed to connect to upstream: {0}")]
    Connect(#[source] io::Error),

    #[error("TLS handshake with upstream failed: {0}")]
    Tls(#[source] io::Error),

    #[error("upgrade exchange failed: {0}")]
    Io(#[from] io::Error),

    #[error("upstream closed the connection before responding")]
    Closed,

    #[error("invalid upgrade response from upstream")]
    InvalidResponse,
}

/// Stream to the upstream, plain or TLS
pub trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamIo for T {}

/// Outcome of replaying an upgrade request to the upstream
struct Negotiated {
    stream: Box<dyn UpstreamIo>,
    status: StatusCode,
    headers: Vec<(String, String)>,
    /// Bytes read past the response head
    leftover: Vec<u8>,
}

/// Check if a request asks for the SPDY/3.1 upgrade
pub fn is_stream_upgrade<B>(req: &Request<B>) -> bool {
    req.headers()
        .get_all(UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim().eq_ignore_ascii_case(STREAM_PROTOCOL))
}

pub struct StreamTunnel {
    base: Uri,
    tls: Option<TlsConnector>,
    stats: Arc<ProxyStats>,
}

impl StreamTunnel {
    pub fn new(base: Uri, ca_file: Option<&str>, stats: Arc<ProxyStats>) -> anyhow::Result<Self> {
        let tls = if base.scheme_str() == Some("https") {
            let mut config = client_tls_config(ca_file)?;
            config.alpn_protocols = vec![b"http/1.1".to_vec()];
            Some(TlsConnector::from(Arc::new(config)))
        } else {
            None
        };
        Ok(Self { base, tls, stats })
    }

    /// Negotiate the upgrade with the upstream and, once it agrees, hand
    /// the client its 101 and start forwarding in the background.
    pub async fn handle(&self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let started = Instant::now();
        let negotiated = self.negotiate(&req).await;
        self.stats.record_negotiation(started.elapsed());

        let negotiated = match negotiated {
            Ok(n) => n,
            Err(e) => {
                error!(upstream = %self.base, error = %e, "Stream upgrade negotiation failed");
                self.stats.record_upstream_failure();
                return json_error_response(
                    ProxyErrorCode::UpgradeFailed,
                    format!("Failed to upgrade connection: {}", e),
                );
            }
        };

        if negotiated.status != StatusCode::SWITCHING_PROTOCOLS {
            warn!(status = %negotiated.status, "Upstream rejected stream upgrade");
            return rejected_response(negotiated);
        }

        let Negotiated { stream, headers, leftover, .. } = negotiated;

        let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in &headers {
            let lower = name.to_ascii_lowercase();
            if lower == "content-length" || lower == "transfer-encoding" {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        let response = match response.body(Full::new(Bytes::new()).map_err(|e| match e {}).boxed()) {
            Ok(r) => r,
            Err(e) => {
                return json_error_response(ProxyErrorCode::UpgradeFailed, e.to_string());
            }
        };

        self.stats.record_tunnel();
        info!(upstream = %self.base, "Stream tunnel established");

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => match splice(TokioIo::new(upgraded), stream, leftover).await {
                    Ok((to_upstream, to_client)) => {
                        debug!(to_upstream, to_client, "Stream tunnel closed");
                    }
                    Err(e) => debug!(error = %e, "Stream tunnel closed with error"),
                },
                Err(e) => error!(error = %e, "Failed to upgrade client connection"),
            }
        });

        response
    }

    async fn connect(&self) -> Result<Box<dyn UpstreamIo>, TunnelError> {
        let host = self
            .base
            .host()
            .ok_or_else(|| TunnelError::InvalidUpstream(self.base.to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']');
        let port = self
            .base
            .port_u16()
            .unwrap_or(if self.tls.is_some() { 443 } else { 80 });

        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(TunnelError::Connect)?;
        let _ = tcp.set_nodelay(true);

        match &self.tls {
            Some(connector) => {
                let name = ServerName::try_from(host.to_string())
                    .map_err(|e| TunnelError::InvalidUpstream(e.to_string()))?;
                let stream = connector.connect(name, tcp).await.map_err(TunnelError::Tls)?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(tcp)),
        }
    }

    async fn negotiate(&self, req: &Request<Incoming>) -> Result<Negotiated, TunnelError> {
        let target = join_uri(&self.base, req.uri()).map_err(|e| TunnelError::InvalidUpstream(e.to_string()))?;
        let raw_request = build_upgrade_request(req, &target);

        let mut stream = self.connect().await?;
        stream.write_all(&raw_request).await?;
        stream.flush().await?;

        let mut head = Vec::with_capacity(1024);
        let mut chunk = [0u8; 4096];
        let head_len = loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(TunnelError::Closed);
            }
            head.extend_from_slice(&chunk[..n]);
            if let Some(end) = find_head_end(&head) {
                break end;
            }
            if head.len() > MAX_RESPONSE_HEAD {
                return Err(TunnelError::InvalidResponse);
            }
        };

        let leftover = head.split_off(head_len);
        let (status, headers) = parse_upgrade_response(&head).ok_or(TunnelError::InvalidResponse)?;

        Ok(Negotiated {
            stream,
            status,
            headers,
            leftover,
        })
    }
}

fn rejected_response(negotiated: Negotiated) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut builder = Response::builder().status(negotiated.status);
    for (name, value) in &negotiated.headers {
        let lower = name.to_ascii_lowercase();
        if matches!(lower.as_str(), "connection" | "upgrade" | "transfer-encoding" | "content-length") {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            builder = builder.header(name.as_str(), hv);
        }
    }

    match builder.body(Full::new(Bytes::from(negotiated.leftover)).map_err(|e| match e {}).boxed()) {
        Ok(mut response) => {
            strip_upstream_cors(response.headers_mut());
            response
        }
        Err(e) => json_error_response(ProxyErrorCode::UpgradeFailed, e.to_string()),
    }
}

/// Build the raw HTTP/1.1 upgrade request replayed to the upstream. Every
/// client header is forwarded, including the requested stream protocol
/// versions; `Host` names the upstream.
fn build_upgrade_request<B>(req: &Request<B>, target: &Uri) -> Vec<u8> {
    let path = target.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    if let Some(authority) = target.authority() {
        request.push_str(&format!("Host: {}\r\n", authority));
    }
    request.push_str("\r\n");

    request.into_bytes()
}

/// Offset just past the blank line ending a response head
fn find_head_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Parse the status line and headers of the upstream's reply
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 || !parts[0].starts_with("HTTP/") {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Copy bytes both ways between the client and upstream connections.
///
/// Each direction runs as its own task. When the upstream stops sending,
/// the client connection is shut down and the other direction abandoned,
/// so a closed upstream never leaves the client half-open.
async fn splice<C, U>(client: C, upstream: U, leftover: Vec<u8>) -> io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    if !leftover.is_empty() {
        client_write.write_all(&leftover).await?;
    }

    let to_upstream = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        copied
    });

    let to_client = tokio::io::copy(&mut upstream_read, &mut client_write).await;
    let _ = client_write.shutdown().await;

    let sent = if to_upstream.is_finished() {
        match to_upstream.await {
            Ok(Ok(n)) => n,
            _ => 0,
        }
    } else {
        to_upstream.abort();
        0
    };

    Ok((sent, to_client? + leftover.len() as u64))
}
