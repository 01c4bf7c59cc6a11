use crate::attributes::{AttributeResolver, Attributes};
use crate::authn::{Authenticator, Identity};
use crate::authz::Authorizer;
use crate::client_cert::PeerCertificates;
use crate::config::{HeaderConfig, ProxyConfig};
use crate::cors::Cors;
use crate::error::{json_error_response, unauthorized_response, ProxyErrorCode};
use crate::stats::ProxyStats;
use crate::tunnel::{is_stream_upgrade, StreamTunnel};
use crate::upstream::UpstreamClient;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, ORIGIN};
use hyper::http::request::Parts;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Per-request pipeline: authenticate, authorize, then forward
pub struct ProxyHandler {
    /// Snapshot taken at construction
    config: Arc<ProxyConfig>,
    authenticator: Arc<dyn Authenticator>,
    authorizer: Arc<dyn Authorizer>,
    resolver: AttributeResolver,
    upstream: UpstreamClient,
    tunnel: StreamTunnel,
    cors: Option<Cors>,
    stats: Arc<ProxyStats>,
}

impl ProxyHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &ProxyConfig,
        authenticator: Arc<dyn Authenticator>,
        authorizer: Arc<dyn Authorizer>,
        resolver: AttributeResolver,
        upstream: UpstreamClient,
        tunnel: StreamTunnel,
        stats: Arc<ProxyStats>,
    ) -> Self {
        Self {
            config: Arc::new(config.clone()),
            cors: Cors::new(&config.cors),
            authenticator,
            authorizer,
            resolver,
            upstream,
            tunnel,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        self.stats.record_request();

        let (mut parts, body) = req.into_parts();

        let request_id = match parts.headers.get(X_REQUEST_ID).and_then(|v| v.to_str().ok()) {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                if let Ok(value) = HeaderValue::from_str(&id) {
                    parts.headers.insert(X_REQUEST_ID, value);
                }
                id
            }
        };

        if let Some(cors) = &self.cors {
            if let Some(response) = cors.preflight(&parts) {
                debug!(request_id, "Answered CORS preflight");
                return response;
            }
        }
        let origin = parts.headers.get(ORIGIN).cloned();

        let mut response = match self.check_access(&mut parts, &request_id).await {
            Some(rejection) => rejection,
            None => {
                let req = Request::from_parts(parts, body);
                self.dispatch(req, client_addr, is_tls, &request_id).await
            }
        };

        if let Some(cors) = &self.cors {
            cors.apply(origin.as_ref(), response.headers_mut());
        }
        response
    }

    /// Authenticate and authorize the request. Returns the rejection to send
    /// back, or `None` when the request may be forwarded; in that case the
    /// identity headers have been added when configured.
    async fn check_access(
        &self,
        parts: &mut Parts,
        request_id: &str,
    ) -> Option<Response<BoxBody<Bytes, hyper::Error>>> {
        let user = match self.authenticator.authenticate(parts).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                debug!(request_id, path = %parts.uri.path(), "No credentials accepted");
                self.stats.record_unauthenticated();
                return Some(unauthorized_response());
            }
            Err(e) => {
                debug!(request_id, error = %e, "Authentication failed");
                self.stats.record_unauthenticated();
                return Some(unauthorized_response());
            }
        };

        let attrs = match self.resolver.resolve(&user, parts) {
            Ok(attrs) => attrs,
            Err(e) => {
                error!(request_id, error = %e, "Failed to resolve request attributes");
                self.stats.record_authorization_error();
                return Some(json_error_response(
                    ProxyErrorCode::AuthorizationError,
                    "Authorization error",
                ));
            }
        };

        match self.authorizer.authorize(&attrs).await {
            Ok((decision, _)) if decision.is_allowed() => {
                debug!(request_id, user = %user.name, verb = %attrs.verb, "Request allowed");
            }
            Ok((_, reason)) => {
                let message = forbidden_message(&attrs, &reason);
                info!(request_id, "{}", message);
                self.stats.record_forbidden();
                return Some(json_error_response(ProxyErrorCode::Forbidden, message));
            }
            Err(e) => {
                error!(request_id, user = %user.name, error = %e, "Access review failed");
                self.stats.record_authorization_error();
                return Some(json_error_response(
                    ProxyErrorCode::AuthorizationError,
                    "Authorization error",
                ));
            }
        }

        let header = &self.config.authentication.header;
        if header.enabled && !annotate_identity(&mut parts.headers, header, &user) {
            warn!(
                request_id,
                user = ?user.name,
                groups = ?user.groups,
                "Identity is not a valid header value, forwarding without identity headers"
            );
        }
        None
    }

    async fn dispatch(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
        is_tls: bool,
        request_id: &str,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        if is_stream_upgrade(&req) {
            debug!(request_id, path = %req.uri().path(), "Tunneling stream upgrade");
            return self.tunnel.handle(req).await;
        }

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        match self.upstream.send(req, client_addr, is_tls).await {
            Ok(response) => {
                debug!(request_id, %method, path, status = %response.status(), "Proxied request");
                response
            }
            Err(e) => {
                warn!(request_id, upstream = %self.upstream.base(), error = %e, "Upstream request failed");
                self.stats.record_upstream_failure();
                json_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    format!("Failed to reach upstream: {}", e),
                )
            }
        }
    }
}

/// 403 body naming who was refused what
pub fn forbidden_message(attrs: &Attributes, reason: &str) -> String {
    let resource = if attrs.resource_request {
        attrs.resource.as_str()
    } else {
        attrs.path.as_str()
    };
    let mut message = format!(
        "Forbidden (user={}, verb={}, resource={}, subresource={})",
        attrs.user.name, attrs.verb, resource, attrs.subresource
    );
    if !reason.is_empty() {
        message.push_str(": ");
        message.push_str(reason);
    }
    message
}

/// Replace any client-supplied identity headers with the authenticated one.
///
/// Returns false when the identity could not be written because the name or
/// a group is not a valid header value. Client-supplied values are removed
/// either way.
pub fn annotate_identity(headers: &mut HeaderMap, config: &HeaderConfig, user: &Identity) -> bool {
    let (Ok(user_field), Ok(groups_field)) = (
        HeaderName::from_bytes(config.user_field_name.as_bytes()),
        HeaderName::from_bytes(config.groups_field_name.as_bytes()),
    ) else {
        return false;
    };

    headers.remove(&user_field);
    headers.remove(&groups_field);

    let mut complete = true;
    match HeaderValue::from_str(&user.name) {
        Ok(value) => {
            headers.insert(user_field, value);
        }
        Err(_) => complete = false,
    }
    if !user.groups.is_empty() {
        match HeaderValue::from_str(&user.groups.join(&config.group_separator)) {
            Ok(value) => {
                headers.insert(groups_field, value);
            }
            Err(_) => complete = false,
        }
    }
    complete
}

/// Listener serving one address, plain or TLS
pub struct ProxyServer {
    bind_addr: SocketAddr,
    handler: Arc<ProxyHandler>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, handler: Arc<ProxyHandler>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            handler,
            shutdown_rx,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener until shutdown.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let protocol = if self.tls_enabled() { "HTTPS" } else { "HTTP" };
        info!(addr = %local_addr, protocol, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let handler = Arc::clone(&self.handler);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            let peer = tls_stream
                                                .get_ref()
                                                .1
                                                .peer_certificates()
                                                .map(|certs| PeerCertificates(Arc::new(certs.to_vec())));
                                            if let Err(e) = handle_connection(tls_stream, addr, handler, true, peer).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, handler, false, None).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(addr = %local_addr, "Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    handler: Arc<ProxyHandler>,
    is_tls: bool,
    peer: Option<PeerCertificates>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |mut req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        if let Some(peer) = &peer {
            req.extensions_mut().insert(peer.clone());
        }
        async move { Ok::<_, Infallible>(handler.handle(req, addr, is_tls).await) }
    });

    // Cleartext HTTP/2 with prior knowledge is detected from the preface;
    // HTTP/1.1 connections keep upgrade support for stream tunnels
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_config() -> HeaderConfig {
        HeaderConfig {
            enabled: true,
            ..HeaderConfig::default()
        }
    }

    #[test]
    fn test_annotate_identity_overwrites_client_values() {
        let mut headers = HeaderMap::new();
        headers.insert("x-remote-user", HeaderValue::from_static("admin"));
        headers.insert("x-remote-groups", HeaderValue::from_static("system:masters"));

        let user = Identity::new("jane").with_groups(["devs", "ops"]);
        assert!(annotate_identity(&mut headers, &header_config(), &user));

        assert_eq!(headers["x-remote-user"], "jane");
        assert_eq!(headers["x-remote-groups"], "devs|ops");
    }

    #[test]
    fn test_annotate_identity_without_groups() {
        let mut headers = HeaderMap::new();
        headers.insert("x-remote-groups", HeaderValue::from_static("system:masters"));

        assert!(annotate_identity(&mut headers, &header_config(), &Identity::new("jane")));

        assert_eq!(headers["x-remote-user"], "jane");
        assert!(!headers.contains_key("x-remote-groups"));
    }

    #[test]
    fn test_annotate_identity_reports_unencodable_name() {
        let mut headers = HeaderMap::new();
        headers.insert("x-remote-user", HeaderValue::from_static("admin"));

        let user = Identity::new("jane\nx-injected: yes").with_groups(["devs"]);
        assert!(!annotate_identity(&mut headers, &header_config(), &user));

        // The client's value never survives
        assert!(!headers.contains_key("x-remote-user"));
        assert_eq!(headers["x-remote-groups"], "devs");
    }

    #[test]
    fn test_forbidden_message() {
        let attrs = Attributes {
            user: Identity::new("jane"),
            verb: "create".to_string(),
            resource: "pods".to_string(),
            subresource: "exec".to_string(),
            resource_request: true,
            ..Attributes::default()
        };
        assert_eq!(
            forbidden_message(&attrs, "no RBAC policy matched"),
            "Forbidden (user=jane, verb=create, resource=pods, subresource=exec): no RBAC policy matched"
        );

        let attrs = Attributes {
            user: Identity::new("jane"),
            verb: "get".to_string(),
            path: "/metrics".to_string(),
            ..Attributes::default()
        };
        assert_eq!(
            forbidden_message(&attrs, ""),
            "Forbidden (user=jane, verb=get, resource=/metrics, subresource=)"
        );
    }
}
