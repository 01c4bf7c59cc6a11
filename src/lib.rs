//! apiserver-proxy - An authenticating and authorizing reverse proxy
//!
//! This library provides a proxy in front of a single upstream that:
//! - Authenticates requests with OIDC bearer tokens, TokenReview or client certificates
//! - Authorizes them through SubjectAccessReview, from the request path or fixed attributes
//! - Forwards allowed requests over HTTP/1.1, HTTP/2 or forced cleartext HTTP/2
//! - Tunnels SPDY/3.1 upgrades (exec, attach, port-forward) to the upstream
//! - Reloads the serving certificate and the OIDC authenticator when their files rotate

pub mod attributes;
pub mod authn;
pub mod authz;
pub mod client_cert;
pub mod config;
pub mod cors;
pub mod error;
pub mod kube;
pub mod oidc;
pub mod proxy;
pub mod reload;
pub mod stats;
pub mod tls;
pub mod token_review;
pub mod tunnel;
pub mod upstream;
pub mod watch;
