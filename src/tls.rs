//! Server TLS: certificate loading, rotation-aware resolution and the
//! rustls configuration for the secure listener

use crate::config::TlsConfig;
use crate::reload::Reloader;
use rcgen::generate_simple_self_signed;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{RootCertStore, SupportedCipherSuite, SupportedProtocolVersion};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("no private key found in {0}")]
    NoPrivateKey(String),

    #[error("unsupported TLS version '{0}' (expected VersionTLS12 or VersionTLS13)")]
    UnsupportedVersion(String),

    #[error("unknown cipher suite '{0}'")]
    UnknownCipherSuite(String),

    #[error("none of the configured cipher suites can be used with {0}")]
    NoUsableCipherSuites(String),

    #[error("certificate {cert} does not match key {key}: {source}")]
    KeyMismatch {
        cert: String,
        key: String,
        #[source]
        source: rustls::Error,
    },

    #[error("invalid client CA bundle: {0}")]
    ClientCa(String),

    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

static TLS12_AND_UP: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13, &rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Io {
        path: path.to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_string(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_string()));
    }

    Ok(certs)
}

pub fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Io {
        path: path.to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader).map_err(|source| TlsError::Io {
            path: path.to_string(),
            source,
        })? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    Err(TlsError::NoPrivateKey(path.to_string()))
}

/// Read a certificate chain and its key into a signing-ready pair.
///
/// Fails when the leaf certificate was not issued for the key, which is the
/// state seen while a rotation has replaced only one of the two files.
pub fn load_certified_key(cert_path: &str, key_path: &str) -> Result<Arc<CertifiedKey>, TlsError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
    let certified = CertifiedKey::new(certs, signing_key);
    certified.keys_match().map_err(|source| TlsError::KeyMismatch {
        cert: cert_path.to_string(),
        key: key_path.to_string(),
        source,
    })?;
    Ok(Arc::new(certified))
}

/// Certificate used when the secure listener has no certificate files.
pub fn self_signed_certified_key() -> anyhow::Result<Arc<CertifiedKey>> {
    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];

    let rcgen::CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
        .map_err(|e| anyhow::anyhow!("Failed to load generated key: {}", e))?;

    Ok(Arc::new(CertifiedKey::new(vec![cert_der], signing_key)))
}

/// Serves whatever certificate the reloader currently holds, so a rotated
/// certificate is picked up by the next handshake.
pub struct ReloadingCertResolver {
    certs: Arc<Reloader<Arc<CertifiedKey>>>,
}

impl std::fmt::Debug for ReloadingCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadingCertResolver")
            .field("reloader", &self.certs.name())
            .finish()
    }
}

impl ReloadingCertResolver {
    pub fn new(certs: Arc<Reloader<Arc<CertifiedKey>>>) -> Self {
        Self { certs }
    }
}

impl ResolvesServerCert for ReloadingCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.certs.get())
    }
}

/// Fixed certificate, for the self-signed fallback
#[derive(Debug)]
pub struct StaticCertResolver(pub Arc<CertifiedKey>);

impl ResolvesServerCert for StaticCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

pub fn protocol_versions(min_version: &str) -> Result<&'static [&'static SupportedProtocolVersion], TlsError> {
    match min_version {
        "" | "VersionTLS12" => Ok(TLS12_AND_UP),
        "VersionTLS13" => Ok(TLS13_ONLY),
        other => Err(TlsError::UnsupportedVersion(other.to_string())),
    }
}

/// IANA name of a suite, e.g. `TLS_AES_128_GCM_SHA256`
fn iana_name(suite: &SupportedCipherSuite) -> String {
    format!("{:?}", suite.suite()).replacen("TLS13_", "TLS_", 1)
}

/// Restrict the provider's cipher suites to the named ones, in the given
/// order. An empty list keeps the provider defaults.
pub fn select_cipher_suites(
    available: &[SupportedCipherSuite],
    names: &[String],
) -> Result<Vec<SupportedCipherSuite>, TlsError> {
    if names.is_empty() {
        return Ok(available.to_vec());
    }

    names
        .iter()
        .map(|name| {
            available
                .iter()
                .find(|suite| {
                    let iana = iana_name(suite);
                    // Also accept the short ChaCha20 aliases without the hash suffix
                    iana == *name || iana == format!("{}_SHA256", name)
                })
                .copied()
                .ok_or_else(|| TlsError::UnknownCipherSuite(name.clone()))
        })
        .collect()
}

fn crypto_provider(tls: &TlsConfig) -> Result<CryptoProvider, TlsError> {
    let versions = protocol_versions(&tls.min_version)?;
    let mut provider = rustls::crypto::ring::default_provider();
    provider.cipher_suites = select_cipher_suites(&provider.cipher_suites, &tls.cipher_suites)?;

    let usable = provider
        .cipher_suites
        .iter()
        .any(|suite| versions.iter().any(|v| v.version == suite.version().version));
    if !usable {
        return Err(TlsError::NoUsableCipherSuites(tls.min_version.clone()));
    }

    Ok(provider)
}

/// Build the rustls configuration for the secure listener.
///
/// With a client CA bundle, client certificates are requested but optional;
/// presented certificates must chain to that bundle.
pub fn server_config(
    tls: &TlsConfig,
    resolver: Arc<dyn ResolvesServerCert>,
    client_ca_file: Option<&str>,
) -> Result<rustls::ServerConfig, TlsError> {
    let provider = Arc::new(crypto_provider(tls)?);
    let versions = protocol_versions(&tls.min_version)?;

    let builder = rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(versions)?;

    let builder = match client_ca_file {
        Some(path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| TlsError::ClientCa(format!("{}: {}", path, e)))?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .allow_unauthenticated()
                .build()
                .map_err(|e| TlsError::ClientCa(e.to_string()))?;
            info!(ca = %path, "Client certificate authentication enabled");
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder.with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}
