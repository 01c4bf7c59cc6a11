//! Client side of the reverse proxy
//!
//! Requests are rewritten for the single upstream (joined path, forwarding
//! headers, hop-by-hop headers removed) and sent through a pooled client.
//! With forced h2c the client speaks HTTP/2 over plain TCP without any
//! upgrade handshake or TLS, whatever the upstream URL scheme says.

use crate::cors::strip_upstream_cors;
use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Request, Response, Uri, Version};
use hyper_rustls::{ConfigBuilderExt, HttpsConnector};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that only apply to a single connection
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const POOL_MAX_IDLE_PER_HOST: usize = 32;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("failed to build upstream request: {0}")]
    RequestBuild(String),
}

enum Transport {
    Standard(Client<HttpsConnector<HttpConnector>, Incoming>),
    ForcedH2c(Client<HttpConnector, Incoming>),
}

/// Pooled client for the configured upstream
pub struct UpstreamClient {
    base: Uri,
    transport: Transport,
}

impl UpstreamClient {
    pub fn new(base: Uri, force_h2c: bool, ca_file: Option<&str>) -> anyhow::Result<Self> {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);

        let transport = if force_h2c {
            let client = Client::builder(TokioExecutor::new())
                .http2_only(true)
                .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
                .pool_idle_timeout(POOL_IDLE_TIMEOUT)
                .build(http);
            Transport::ForcedH2c(client)
        } else {
            let tls = client_tls_config(ca_file)?;
            let builder = hyper_rustls::HttpsConnectorBuilder::new().with_tls_config(tls);
            let connector = builder
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .wrap_connector(http);

            let client = Client::builder(TokioExecutor::new())
                .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
                .pool_idle_timeout(POOL_IDLE_TIMEOUT)
                .build(connector);
            Transport::Standard(client)
        };

        debug!(upstream = %base, force_h2c, "Upstream client initialized");
        Ok(Self { base, transport })
    }

    pub fn base(&self) -> &Uri {
        &self.base
    }

    pub fn force_h2c(&self) -> bool {
        matches!(self.transport, Transport::ForcedH2c(_))
    }

    /// Forward `req` to the upstream and return its response with
    /// connection-level and CORS headers removed.
    pub async fn send(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, UpstreamError> {
        let target = join_uri(&self.base, req.uri())?;
        let req = prepare_request(req, target, client_addr, is_tls);

        let response = match &self.transport {
            Transport::Standard(client) => client.request(req).await?,
            Transport::ForcedH2c(client) => client.request(req).await?,
        };

        let (mut parts, body) = response.into_parts();
        remove_hop_by_hop(&mut parts.headers);
        strip_upstream_cors(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Whether `upstream` points at the same host and port as `api_server`.
/// Forced h2c is never used against the cluster API server.
pub fn targets_api_server(upstream: &Uri, api_server: &str) -> bool {
    let Ok(api_server) = api_server.parse::<Uri>() else {
        return false;
    };
    match (upstream.host(), api_server.host()) {
        (Some(a), Some(b)) if a.eq_ignore_ascii_case(b) => effective_port(upstream) == effective_port(&api_server),
        _ => false,
    }
}

fn effective_port(uri: &Uri) -> Option<u16> {
    uri.port_u16().or(match uri.scheme_str() {
        Some("https") => Some(443),
        Some("http") => Some(80),
        _ => None,
    })
}

/// TLS settings for connections to an https upstream. `ca_file` replaces
/// the bundled web roots as trust anchors.
pub fn client_tls_config(ca_file: Option<&str>) -> anyhow::Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?;

    let config = match ca_file {
        Some(path) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in crate::tls::load_certs(path)? {
                roots.add(cert)?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        None => builder.with_webpki_roots().with_no_client_auth(),
    };
    Ok(config)
}

/// Join the upstream base with a request URI, merging paths the way a
/// single-host reverse proxy does and combining both query strings.
pub fn join_uri(base: &Uri, request: &Uri) -> Result<Uri, UpstreamError> {
    let base_path = base.path();
    let req_path = request.path();

    let path = match (base_path.ends_with('/'), req_path.starts_with('/')) {
        (true, true) => format!("{}{}", base_path, &req_path[1..]),
        (false, false) => format!("{}/{}", base_path, req_path),
        _ => format!("{}{}", base_path, req_path),
    };

    let query = match (base.query(), request.query()) {
        (Some(b), Some(r)) if !b.is_empty() && !r.is_empty() => Some(format!("{}&{}", b, r)),
        (Some(b), _) if !b.is_empty() => Some(b.to_string()),
        (_, Some(r)) if !r.is_empty() => Some(r.to_string()),
        _ => None,
    };

    let path_and_query = match query {
        Some(q) => format!("{}?{}", path, q),
        None => path,
    };

    let mut builder = Uri::builder().path_and_query(path_and_query);
    if let Some(scheme) = base.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = base.authority() {
        builder = builder.authority(authority.clone());
    }
    builder
        .build()
        .map_err(|e| UpstreamError::RequestBuild(e.to_string()))
}

/// Drop hop-by-hop headers, including any named in `Connection`.
pub fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Point `req` at `target` and add forwarding headers.
pub fn prepare_request<B>(req: Request<B>, target: Uri, client_addr: SocketAddr, is_tls: bool) -> Request<B> {
    let (mut parts, body) = req.into_parts();
    let headers = &mut parts.headers;

    let original_host = headers
        .get(HOST)
        .cloned()
        .or_else(|| parts.uri.authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()));

    remove_hop_by_hop(headers);
    // The client sets Host from the target URI
    headers.remove(HOST);

    let client_ip = client_addr.ip().to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, client_ip),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = original_host {
        headers.insert(X_FORWARDED_HOST, host);
    }

    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    parts.uri = target;
    // The connection decides between HTTP/1.1 and HTTP/2
    parts.version = Version::HTTP_11;
    Request::from_parts(parts, body)
}
