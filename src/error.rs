//! Error responses produced by the proxy itself
//!
//! Every rejection the proxy generates carries a JSON body and an
//! `X-Proxy-Error` header so clients can tell proxy failures apart from
//! upstream responses.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{header, Response, StatusCode};
use serde::Serialize;

pub const PROXY_ERROR_HEADER: &str = "x-proxy-error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No authentication strategy accepted the request
    Unauthorized,
    /// The access review denied the request
    Forbidden,
    /// The access review could not be performed
    AuthorizationError,
    /// Failed to connect to or exchange with the upstream
    ConnectionFailed,
    /// The upstream refused or botched the stream upgrade
    UpgradeFailed,
    InternalError,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::ConnectionFailed | Self::UpgradeFailed => StatusCode::BAD_GATEWAY,
            Self::AuthorizationError | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire name, as used in both the header and the body
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::AuthorizationError => "AUTHORIZATION_ERROR",
            Self::ConnectionFailed => "CONNECTION_FAILED",
            Self::UpgradeFailed => "UPGRADE_FAILED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Body of a proxy-generated error
#[derive(Debug, Serialize)]
pub struct ErrorBody<'a> {
    pub code: ProxyErrorCode,
    pub message: &'a str,
    pub status: u16,
}

impl<'a> ErrorBody<'a> {
    pub fn new(code: ProxyErrorCode, message: &'a str) -> Self {
        Self {
            code,
            message,
            status: code.status_code().as_u16(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        // Serializing a code, a str and a u16 cannot fail
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }
}

/// Build a JSON error response carrying the `X-Proxy-Error` header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl AsRef<str>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorBody::new(code, message.as_ref()).to_bytes();

    let mut response = Response::new(Full::new(body).map_err(|e| match e {}).boxed());
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("application/json"));
    headers.insert(PROXY_ERROR_HEADER, header::HeaderValue::from_static(code.as_str()));
    response
}

/// The generic 401 returned whenever authentication fails or is absent
pub fn unauthorized_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    json_error_response(ProxyErrorCode::Unauthorized, "Unauthorized")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ProxyErrorCode::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ProxyErrorCode::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            ProxyErrorCode::AuthorizationError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ProxyErrorCode::UpgradeFailed.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_body_json() {
        let body = ErrorBody::new(
            ProxyErrorCode::Forbidden,
            "Forbidden (user=jane, verb=get, resource=pods, subresource=log)",
        );
        let json: serde_json::Value = serde_json::from_slice(&body.to_bytes()).unwrap();

        assert_eq!(json["code"], "FORBIDDEN");
        assert_eq!(json["status"], 403);
        assert!(json["message"].as_str().unwrap().contains("user=jane"));
    }

    #[test]
    fn test_serialized_code_matches_header_value() {
        let json = serde_json::to_value(ProxyErrorCode::AuthorizationError).unwrap();
        assert_eq!(json, ProxyErrorCode::AuthorizationError.as_str());
    }

    #[test]
    fn test_unauthorized_response_is_generic() {
        let response = unauthorized_response();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "application/json");
        assert_eq!(response.headers().get(PROXY_ERROR_HEADER).unwrap(), "UNAUTHORIZED");
    }
}
