//! CORS handling for responses leaving the proxy
//!
//! The upstream's own CORS headers are always removed; when origins are
//! configured the proxy answers preflights itself and decorates responses
//! to allowed origins.

use crate::config::CorsConfig;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::Bytes;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS,
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_METHOD, ORIGIN, VARY,
};
use hyper::http::request::Parts;
use hyper::{Method, Response, StatusCode};

/// Headers removed from every upstream response
pub const UPSTREAM_CORS_HEADERS: [HeaderName; 4] = [
    ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_HEADERS,
    ACCESS_CONTROL_ALLOW_CREDENTIALS,
];

pub fn strip_upstream_cors(headers: &mut HeaderMap) {
    for name in &UPSTREAM_CORS_HEADERS {
        headers.remove(name);
    }
}

#[derive(Debug, Clone)]
pub struct Cors {
    allow_origins: Vec<String>,
    allow_methods: String,
    allow_headers: String,
    allow_credentials: bool,
    max_age: u64,
}

impl Cors {
    /// `None` when no origins are configured
    pub fn new(config: &CorsConfig) -> Option<Self> {
        if config.allow_origins.is_empty() {
            return None;
        }
        Some(Self {
            allow_origins: config.allow_origins.clone(),
            allow_methods: config.allow_methods.join(", "),
            allow_headers: config.allow_headers.join(", "),
            allow_credentials: config.allow_credentials,
            max_age: config.max_age_secs,
        })
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.allow_origins.iter().any(|o| o == "*" || o == origin)
    }

    fn allowed_origin<'a>(&self, origin: Option<&'a HeaderValue>) -> Option<&'a HeaderValue> {
        let origin = origin?;
        let allowed = origin
            .to_str()
            .map(|o| self.origin_allowed(o))
            .unwrap_or(false);
        allowed.then_some(origin)
    }

    /// Answer a preflight from an allowed origin. Anything else, including
    /// preflights from unknown origins, goes through the normal path.
    pub fn preflight(&self, req: &Parts) -> Option<Response<BoxBody<Bytes, hyper::Error>>> {
        if req.method != Method::OPTIONS || !req.headers.contains_key(ACCESS_CONTROL_REQUEST_METHOD) {
            return None;
        }
        let origin = self.allowed_origin(req.headers.get(ORIGIN))?.clone();

        let mut response = Response::new(Empty::<Bytes>::new().map_err(|e| match e {}).boxed());
        *response.status_mut() = StatusCode::NO_CONTENT;

        let headers = response.headers_mut();
        self.decorate(origin, headers);
        if let Ok(methods) = HeaderValue::from_str(&self.allow_methods) {
            headers.insert(ACCESS_CONTROL_ALLOW_METHODS, methods);
        }
        if let Ok(allow_headers) = HeaderValue::from_str(&self.allow_headers) {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, allow_headers);
        }
        headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(self.max_age));

        Some(response)
    }

    /// Add this proxy's CORS headers to a response for a request that
    /// carried `origin`.
    pub fn apply(&self, origin: Option<&HeaderValue>, headers: &mut HeaderMap) {
        if let Some(origin) = self.allowed_origin(origin) {
            self.decorate(origin.clone(), headers);
        }
    }

    fn decorate(&self, origin: HeaderValue, headers: &mut HeaderMap) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        if self.allow_credentials {
            headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
        }
        headers.append(VARY, HeaderValue::from_static("Origin"));
    }
}
