//! Shared helpers for the integration tests: fake collaborators, in-process
//! upstreams and a raw HTTP/1.1 client.

#![allow(dead_code)]

use apiserver_proxy::attributes::{AttributeResolver, Attributes};
use apiserver_proxy::authn::{bearer_token, Authenticator, AuthnError, Identity};
use apiserver_proxy::authz::{Authorizer, AuthzError, Decision};
use apiserver_proxy::config::ProxyConfig;
use apiserver_proxy::kube::KubeError;
use apiserver_proxy::proxy::{ProxyHandler, ProxyServer};
use apiserver_proxy::stats::ProxyStats;
use apiserver_proxy::tunnel::StreamTunnel;
use apiserver_proxy::upstream::UpstreamClient;
use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::http::request::Parts;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

pub const ALICE_TOKEN: &str = "alice-token";
pub const BOB_TOKEN: &str = "bob-token";
pub const CAROL_TOKEN: &str = "carol-token";

/// Maps a few well-known bearer tokens to users
pub struct StaticTokens;

#[async_trait]
impl Authenticator for StaticTokens {
    async fn authenticate(&self, req: &Parts) -> Result<Option<Identity>, AuthnError> {
        match bearer_token(req) {
            None => Ok(None),
            Some(ALICE_TOKEN) => Ok(Some(Identity::new("alice").with_groups(["devs", "ops"]))),
            Some(BOB_TOKEN) => Ok(Some(Identity::new("bob"))),
            Some(CAROL_TOKEN) => Ok(Some(Identity::new("carol"))),
            Some(_) => Err(AuthnError::InvalidToken("unknown token".to_string())),
        }
    }
}

/// Allows alice, denies bob, fails for carol; remembers what it was asked.
/// Any other user (e.g. from a client certificate) is allowed.
#[derive(Default)]
pub struct RecordingAuthorizer {
    pub seen: Mutex<Vec<Attributes>>,
}

impl RecordingAuthorizer {
    pub fn last(&self) -> Option<Attributes> {
        self.seen.lock().last().cloned()
    }
}

#[async_trait]
impl Authorizer for RecordingAuthorizer {
    async fn authorize(&self, attrs: &Attributes) -> Result<(Decision, String), AuthzError> {
        self.seen.lock().push(attrs.clone());
        match attrs.user.name.as_str() {
            "bob" => Ok((Decision::Deny, "no policy for bob".to_string())),
            "carol" => Err(AuthzError::Review(KubeError::Status {
                status: 500,
                body: "internal error".to_string(),
            })),
            _ => Ok((Decision::Allow, String::new())),
        }
    }
}

pub struct ProxyOptions {
    pub upstream: String,
    pub force_h2c: bool,
    pub config: ProxyConfig,
    pub authenticator: Arc<dyn Authenticator>,
    pub tls: Option<TlsAcceptor>,
}

impl ProxyOptions {
    pub fn new(upstream: impl Into<String>) -> Self {
        Self {
            upstream: upstream.into(),
            force_h2c: false,
            config: ProxyConfig::default(),
            authenticator: Arc::new(StaticTokens),
            tls: None,
        }
    }
}

pub struct TestProxy {
    pub addr: SocketAddr,
    pub stats: Arc<ProxyStats>,
    pub authorizer: Arc<RecordingAuthorizer>,
    shutdown: watch::Sender<bool>,
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

pub async fn start_proxy(options: ProxyOptions) -> TestProxy {
    let stats = Arc::new(ProxyStats::default());
    let authorizer = Arc::new(RecordingAuthorizer::default());
    let base: hyper::Uri = options.upstream.parse().unwrap();

    let upstream = UpstreamClient::new(base.clone(), options.force_h2c, None).unwrap();
    let tunnel = StreamTunnel::new(base, None, stats.clone()).unwrap();
    let handler = Arc::new(ProxyHandler::new(
        &options.config,
        options.authenticator,
        authorizer.clone(),
        AttributeResolver::from_path(),
        upstream,
        tunnel,
        stats.clone(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown, shutdown_rx) = watch::channel(false);

    let mut server = ProxyServer::new(addr, handler, shutdown_rx);
    if let Some(acceptor) = options.tls {
        server = server.with_tls(acceptor);
    }
    tokio::spawn(server.serve(listener));

    TestProxy {
        addr,
        stats,
        authorizer,
        shutdown,
    }
}

async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let headers: serde_json::Map<String, serde_json::Value> = req
        .headers()
        .iter()
        .map(|(name, value)| (name.to_string(), json!(value.to_str().unwrap_or_default())))
        .collect();
    let body = json!({
        "method": req.method().as_str(),
        "path": req.uri().path(),
        "query": req.uri().query(),
        "version": format!("{:?}", req.version()),
        "headers": headers,
    });

    let response = Response::builder()
        .header("content-type", "application/json")
        .header("access-control-allow-origin", "*")
        .header("access-control-allow-methods", "GET, DELETE")
        .header("access-control-allow-headers", "X-Upstream")
        .header("access-control-allow-credentials", "true")
        .header("x-upstream", "echo")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap();
    Ok(response)
}

/// Upstream answering every request with a JSON description of it
pub async fn start_echo_upstream(http2_only: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                if http2_only {
                    let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service_fn(echo))
                        .await;
                } else {
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service_fn(echo))
                        .await;
                }
            });
        }
    });

    addr
}

async fn read_head(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut data = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before end of head");
        data.extend_from_slice(&chunk[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = data.split_off(pos + 4);
            return (String::from_utf8(data).unwrap(), rest);
        }
    }
}

/// Upstream speaking just enough HTTP/1.1 to accept a SPDY upgrade, then
/// echoing one read back prefixed with `echo:` and closing.
pub async fn start_spdy_upstream() -> (SocketAddr, Arc<Mutex<Option<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(Mutex::new(None));
    let seen = received.clone();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let seen = seen.clone();
            tokio::spawn(async move {
                let (head, _) = read_head(&mut stream).await;
                let accepted = head.to_ascii_lowercase().contains("upgrade: spdy/3.1");
                *seen.lock() = Some(head);

                if !accepted {
                    let _ = stream
                        .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 11\r\n\r\nbad request")
                        .await;
                    return;
                }

                stream
                    .write_all(
                        b"HTTP/1.1 101 Switching Protocols\r\n\
                          Connection: Upgrade\r\n\
                          Upgrade: SPDY/3.1\r\n\
                          X-Stream-Protocol-Version: v4.channel.k8s.io\r\n\r\n",
                    )
                    .await
                    .unwrap();

                let mut buf = [0u8; 1024];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let mut reply = b"echo:".to_vec();
                reply.extend_from_slice(&buf[..n]);
                let _ = stream.write_all(&reply).await;
                // Closing here must close the client's side of the tunnel
            });
        }
    });

    (addr, received)
}

/// Address nothing listens on
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap_or_else(|e| panic!("invalid JSON body {:?}: {}", self.body, e))
    }
}

fn dechunk(body: &str) -> String {
    let mut out = String::new();
    let mut rest = body;
    while let Some((size, tail)) = rest.split_once("\r\n") {
        let size = usize::from_str_radix(size.trim(), 16).unwrap_or(0);
        if size == 0 {
            break;
        }
        out.push_str(&tail[..size]);
        rest = &tail[size + 2..];
    }
    out
}

pub fn parse_response(raw: &str) -> RawResponse {
    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
    let mut lines = head.lines();
    let status_line = lines.next().unwrap_or_default();
    let status = status_line
        .split(' ')
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);

    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
        .collect();

    let chunked = headers
        .iter()
        .any(|(n, v)| n.eq_ignore_ascii_case("transfer-encoding") && v.eq_ignore_ascii_case("chunked"));
    let body = if chunked { dechunk(body) } else { body.to_string() };

    RawResponse { status, headers, body }
}

/// Send one request with `Connection: close` and read the whole response
pub async fn request(addr: SocketAddr, method: &str, path: &str, headers: &[(&str, &str)]) -> RawResponse {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let mut raw = format!("{} {} HTTP/1.1\r\nHost: proxy.test\r\nConnection: close\r\n", method, path);
    for (name, value) in headers {
        raw.push_str(&format!("{}: {}\r\n", name, value));
    }
    raw.push_str("\r\n");
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_string(&mut response))
        .await
        .expect("response within timeout")
        .unwrap();
    parse_response(&response)
}

pub async fn get(addr: SocketAddr, path: &str, token: Option<&str>) -> RawResponse {
    match token {
        Some(token) => {
            let auth = format!("Bearer {}", token);
            request(addr, "GET", path, &[("Authorization", auth.as_str())]).await
        }
        None => request(addr, "GET", path, &[]).await,
    }
}

/// Open a SPDY upgrade through the proxy and return the stream with the
/// response head and any bytes read past it.
pub async fn open_spdy(addr: SocketAddr, path: &str, token: &str) -> (TcpStream, RawResponse, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let raw = format!(
        "POST {} HTTP/1.1\r\nHost: proxy.test\r\nAuthorization: Bearer {}\r\n\
         Connection: Upgrade\r\nUpgrade: SPDY/3.1\r\n\
         X-Stream-Protocol-Version: v4.channel.k8s.io\r\n\
         X-Stream-Protocol-Version: channel.k8s.io\r\nContent-Length: 0\r\n\r\n",
        path, token
    );
    stream.write_all(raw.as_bytes()).await.unwrap();

    let (head, rest) = read_head(&mut stream).await;
    (stream, parse_response(&head), rest)
}
