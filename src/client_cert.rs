//! Client certificate authentication
//!
//! The TLS handshake already verified the presented chain against the client
//! CA bundle; the accept loop attaches that chain to every request of the
//! connection. The user is the leaf's CommonName and the groups are its
//! Organization values.

use crate::authn::{Authenticator, AuthnError, Identity};
use async_trait::async_trait;
use hyper::http::request::Parts;
use rustls::pki_types::CertificateDer;
use std::sync::Arc;
use x509_parser::prelude::*;

/// Verified peer chain of a TLS connection, leaf first
#[derive(Debug, Clone)]
pub struct PeerCertificates(pub Arc<Vec<CertificateDer<'static>>>);

impl PeerCertificates {
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.0.first()
    }
}

#[derive(Debug, Default)]
pub struct ClientCertAuthenticator;

impl ClientCertAuthenticator {
    pub fn new() -> Self {
        Self
    }
}

/// Map a certificate subject onto an identity
pub fn identity_from_certificate(der: &[u8]) -> Result<Identity, AuthnError> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| AuthnError::InvalidCertificate(e.to_string()))?;
    let subject = cert.subject();

    let name = subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .filter(|cn| !cn.is_empty())
        .ok_or_else(|| AuthnError::InvalidCertificate("certificate has no CommonName".to_string()))?;

    let groups: Vec<String> = subject
        .iter_organization()
        .filter_map(|o| o.as_str().ok())
        .map(str::to_string)
        .collect();

    Ok(Identity::new(name).with_groups(groups))
}

#[async_trait]
impl Authenticator for ClientCertAuthenticator {
    async fn authenticate(&self, req: &Parts) -> Result<Option<Identity>, AuthnError> {
        let Some(leaf) = req
            .extensions
            .get::<PeerCertificates>()
            .and_then(PeerCertificates::leaf)
        else {
            return Ok(None);
        };

        identity_from_certificate(leaf.as_ref()).map(Some)
    }
}
