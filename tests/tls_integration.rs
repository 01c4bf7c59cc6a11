//! Secure listener tests: client certificate authentication and serving
//! certificate rotation

mod common;

use apiserver_proxy::authn::AuthenticatorChain;
use apiserver_proxy::client_cert::ClientCertAuthenticator;
use apiserver_proxy::config::TlsConfig;
use apiserver_proxy::reload::Reloader;
use apiserver_proxy::tls::{self, ReloadingCertResolver};
use apiserver_proxy::watch::Watcher;
use common::*;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair,
};
use rustls::pki_types::{PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::client::TlsStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

struct Ca {
    cert: Certificate,
    key: KeyPair,
}

fn ca() -> Ca {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, "test-ca");
    let key = KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    Ca { cert, key }
}

fn issue(ca: &Ca, cn: &str, org: Option<&str>, server: bool) -> (Certificate, KeyPair) {
    let sans = if server { vec!["localhost".to_string()] } else { Vec::new() };
    let mut params = CertificateParams::new(sans).unwrap();
    params.distinguished_name = DistinguishedName::new();
    params.distinguished_name.push(DnType::CommonName, cn);
    if let Some(org) = org {
        params.distinguished_name.push(DnType::OrganizationName, org);
    }
    params.extended_key_usages = vec![if server {
        ExtendedKeyUsagePurpose::ServerAuth
    } else {
        ExtendedKeyUsagePurpose::ClientAuth
    }];
    let key = KeyPair::generate().unwrap();
    let cert = params.signed_by(&key, &ca.cert, &ca.key).unwrap();
    (cert, key)
}

fn write_server_pair(dir: &Path, cert: &Certificate, key: &KeyPair) {
    std::fs::write(dir.join("tls.crt"), cert.pem()).unwrap();
    std::fs::write(dir.join("tls.key"), key.serialize_pem()).unwrap();
}

fn client_config(ca: &Ca, identity: Option<&(Certificate, KeyPair)>) -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.add(ca.cert.der().clone()).unwrap();

    let builder = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots);
    let config = match identity {
        Some((cert, key)) => builder
            .with_client_auth_cert(
                vec![cert.der().clone()],
                PrivateKeyDer::try_from(key.serialize_der()).unwrap(),
            )
            .unwrap(),
        None => builder.with_no_client_auth(),
    };
    TlsConnector::from(Arc::new(config))
}

struct SecureProxy {
    proxy: TestProxy,
    dir: TempDir,
    _watcher_shutdown: watch::Sender<bool>,
}

/// Secure proxy whose certificate files live in a temp dir and are watched
async fn start_secure_proxy(ca: &Ca) -> SecureProxy {
    let dir = TempDir::new().unwrap();
    let (cert, key) = issue(ca, "proxy", None, true);
    write_server_pair(dir.path(), &cert, &key);
    std::fs::write(dir.path().join("ca.crt"), ca.cert.pem()).unwrap();

    let cert_path = dir.path().join("tls.crt").to_string_lossy().to_string();
    let key_path = dir.path().join("tls.key").to_string_lossy().to_string();
    let ca_path = dir.path().join("ca.crt").to_string_lossy().to_string();

    let (c, k) = (cert_path.clone(), key_path.clone());
    let certs = Arc::new(Reloader::new("tls-certificate", move || Ok(tls::load_certified_key(&c, &k)?)).unwrap());

    let (watcher_shutdown, watcher_rx) = watch::channel(false);
    let reloader = certs.clone();
    let watcher = Watcher::new(
        "tls-certificate",
        vec![PathBuf::from(&cert_path), PathBuf::from(&key_path)],
        Duration::from_millis(100),
        move || reloader.reload(),
    );
    tokio::spawn(watcher.run(watcher_rx));

    let server_config = tls::server_config(
        &TlsConfig::default(),
        Arc::new(ReloadingCertResolver::new(certs)),
        Some(&ca_path),
    )
    .unwrap();

    let upstream = start_echo_upstream(false).await;
    let mut chain = AuthenticatorChain::new();
    chain.add("tokens", StaticTokens);
    chain.add("x509", ClientCertAuthenticator::new());

    let mut options = ProxyOptions::new(format!("http://{}", upstream));
    options.authenticator = Arc::new(chain);
    options.tls = Some(TlsAcceptor::from(Arc::new(server_config)));
    let proxy = start_proxy(options).await;

    // Give the watcher time to install its directory watch
    tokio::time::sleep(Duration::from_millis(100)).await;

    SecureProxy {
        proxy,
        dir,
        _watcher_shutdown: watcher_shutdown,
    }
}

async fn connect(addr: SocketAddr, connector: &TlsConnector) -> TlsStream<TcpStream> {
    let tcp = TcpStream::connect(addr).await.unwrap();
    connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap()
}

fn served_certificate(stream: &TlsStream<TcpStream>) -> Vec<u8> {
    stream.get_ref().1.peer_certificates().unwrap()[0].as_ref().to_vec()
}

async fn tls_get(addr: SocketAddr, connector: &TlsConnector, token: Option<&str>) -> RawResponse {
    let mut stream = connect(addr, connector).await;

    let mut raw = "GET /api/v1/namespaces/default/secrets HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n".to_string();
    if let Some(token) = token {
        raw.push_str(&format!("Authorization: Bearer {}\r\n", token));
    }
    raw.push_str("\r\n");
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut data = Vec::new();
    match tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut data))
        .await
        .expect("response within timeout")
    {
        Ok(_) => {}
        // Peer closed without close_notify; the response is complete
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {}
        Err(e) => panic!("read failed: {}", e),
    }
    parse_response(&String::from_utf8(data).unwrap())
}

#[tokio::test]
async fn test_client_certificate_identity() {
    let ca = ca();
    let secure = start_secure_proxy(&ca).await;
    let client = issue(&ca, "dave", Some("platform"), false);

    let response = tls_get(secure.proxy.addr, &client_config(&ca, Some(&client)), None).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.json()["headers"]["x-forwarded-proto"], "https");
    let attrs = secure.proxy.authorizer.last().unwrap();
    assert_eq!(attrs.user.name, "dave");
    assert_eq!(attrs.user.groups, vec!["platform".to_string()]);
    assert_eq!(attrs.resource, "secrets");
}

#[tokio::test]
async fn test_token_strategy_runs_before_client_certificate() {
    let ca = ca();
    let secure = start_secure_proxy(&ca).await;
    let client = issue(&ca, "dave", None, false);

    let response = tls_get(secure.proxy.addr, &client_config(&ca, Some(&client)), Some(ALICE_TOKEN)).await;

    assert_eq!(response.status, 200);
    assert_eq!(secure.proxy.authorizer.last().unwrap().user.name, "alice");
}

#[tokio::test]
async fn test_bad_token_falls_back_to_client_certificate() {
    let ca = ca();
    let secure = start_secure_proxy(&ca).await;
    let client = issue(&ca, "dave", None, false);

    let response = tls_get(secure.proxy.addr, &client_config(&ca, Some(&client)), Some("forged")).await;

    assert_eq!(response.status, 200);
    assert_eq!(secure.proxy.authorizer.last().unwrap().user.name, "dave");
}

#[tokio::test]
async fn test_no_certificate_and_no_token_is_unauthorized() {
    let ca = ca();
    let secure = start_secure_proxy(&ca).await;

    let response = tls_get(secure.proxy.addr, &client_config(&ca, None), None).await;

    assert_eq!(response.status, 401);
}

#[tokio::test]
async fn test_rotated_certificate_served_to_new_handshakes() {
    let ca = ca();
    let secure = start_secure_proxy(&ca).await;
    let connector = client_config(&ca, None);

    let original = served_certificate(&connect(secure.proxy.addr, &connector).await);

    let (cert, key) = issue(&ca, "proxy-rotated", None, true);
    write_server_pair(secure.dir.path(), &cert, &key);

    let rotated = cert.der().as_ref().to_vec();
    let mut served = original.clone();
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        served = served_certificate(&connect(secure.proxy.addr, &connector).await);
        if served == rotated {
            break;
        }
    }
    assert_ne!(served, original);
    assert_eq!(served, rotated);

    // A broken key keeps the last good certificate in service
    std::fs::write(secure.dir.path().join("tls.key"), "not a key").unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let response = tls_get(secure.proxy.addr, &connector, Some(ALICE_TOKEN)).await;
    assert_eq!(response.status, 200);
    assert_eq!(
        served_certificate(&connect(secure.proxy.addr, &connector).await),
        rotated
    );
}
