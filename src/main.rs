use anyhow::Context;
use apiserver_proxy::attributes::AttributeResolver;
use apiserver_proxy::authn::AuthenticatorChain;
use apiserver_proxy::client_cert::ClientCertAuthenticator;
use apiserver_proxy::config::Config;
use apiserver_proxy::kube::KubeClient;
use apiserver_proxy::oidc::OidcAuthenticator;
use apiserver_proxy::proxy::{ProxyHandler, ProxyServer};
use apiserver_proxy::reload::{CancelableReloader, Reloader};
use apiserver_proxy::stats::ProxyStats;
use apiserver_proxy::tls::{self, ReloadingCertResolver, StaticCertResolver};
use apiserver_proxy::token_review::TokenReviewAuthenticator;
use apiserver_proxy::tunnel::StreamTunnel;
use apiserver_proxy::upstream::{targets_api_server, UpstreamClient};
use apiserver_proxy::watch::Watcher;
use rustls::server::ResolvesServerCert;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("apiserver_proxy=info".parse()?),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stats = Arc::new(ProxyStats::default());
    let min_delay = config.server.watch_min_delay();
    let mut watchers: Vec<Watcher> = Vec::new();

    let kube = Arc::new(KubeClient::new(&config.kubernetes).context("Failed to configure Kubernetes client")?);

    // Token strategy first, client certificates as the fallback
    let authn = &config.proxy.authentication;
    let mut chain = AuthenticatorChain::new();
    if authn.oidc.enabled() {
        let oidc_config = authn.oidc.clone();
        let oidc = Arc::new(
            CancelableReloader::new("oidc-authenticator", move || OidcAuthenticator::new(&oidc_config))
                .context("Failed to create OIDC authenticator")?,
        );
        if let Some(ca_file) = &authn.oidc.ca_file {
            let reloader = Arc::clone(&oidc);
            watchers.push(Watcher::new(
                "oidc-ca",
                vec![PathBuf::from(ca_file)],
                min_delay,
                move || reloader.reload(),
            ));
        }
        chain.add("oidc", oidc);
    } else {
        chain.add("token-review", TokenReviewAuthenticator::new(kube.clone()));
    }
    if authn.client_ca_file.is_some() {
        chain.add("x509", ClientCertAuthenticator::new());
    }
    info!(strategies = ?chain.names(), "Authentication chain configured");

    let resolver = match &config.proxy.authorization.resource_attributes_file {
        Some(path) => {
            info!(path = %path, "Authorizing against fixed resource attributes");
            AttributeResolver::fixed(path)?
        }
        None => AttributeResolver::from_path(),
    };

    let upstream_uri = config.upstream_uri()?;
    let mut force_h2c = config.server.upstream_force_h2c;
    if force_h2c && targets_api_server(&upstream_uri, kube.base_url()) {
        warn!(upstream = %upstream_uri, "Ignoring upstream_force_h2c for the cluster API server");
        force_h2c = false;
    }
    let upstream_ca = config.server.upstream_ca_file.as_deref();
    let upstream = UpstreamClient::new(upstream_uri.clone(), force_h2c, upstream_ca)
        .context("Failed to create upstream client")?;
    let tunnel = StreamTunnel::new(upstream_uri, upstream_ca, Arc::clone(&stats))?;

    let handler = Arc::new(ProxyHandler::new(
        &config.proxy,
        Arc::new(chain),
        kube.clone(),
        resolver,
        upstream,
        tunnel,
        Arc::clone(&stats),
    ));

    let tls_acceptor = if config.server.secure_listen_address.is_some() {
        let tls_config = &config.proxy.tls;
        let resolver: Arc<dyn ResolvesServerCert> = match (&tls_config.cert_file, &tls_config.key_file) {
            (Some(cert), Some(key)) => {
                let (cert_path, key_path) = (cert.clone(), key.clone());
                let certs = Arc::new(
                    Reloader::new("tls-certificate", move || {
                        Ok(tls::load_certified_key(&cert_path, &key_path)?)
                    })
                    .context("Failed to load TLS certificate")?,
                );
                let reloader = Arc::clone(&certs);
                watchers.push(Watcher::new(
                    "tls-certificate",
                    vec![PathBuf::from(cert), PathBuf::from(key)],
                    min_delay,
                    move || reloader.reload(),
                ));
                info!(cert = %cert, key = %key, "TLS enabled with provided certificates");
                Arc::new(ReloadingCertResolver::new(certs))
            }
            _ => {
                warn!("TLS enabled with auto-generated self-signed certificate (not for production)");
                Arc::new(StaticCertResolver(tls::self_signed_certified_key()?))
            }
        };
        let server_config = tls::server_config(tls_config, resolver, authn.client_ca_file.as_deref())
            .context("TLS configuration error")?;
        Some(TlsAcceptor::from(Arc::new(server_config)))
    } else {
        None
    };

    let watcher_handles: Vec<_> = watchers
        .into_iter()
        .map(|watcher| {
            info!(watcher = %watcher.name(), directories = ?watcher.directories(), "Watching credential files");
            tokio::spawn(watcher.run(shutdown_rx.clone()))
        })
        .collect();

    let mut server_handles = Vec::new();
    if let Some(addr) = &config.server.insecure_listen_address {
        let addr = parse_listen_address(addr)?;
        let server = ProxyServer::new(addr, Arc::clone(&handler), shutdown_rx.clone());
        server_handles.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "HTTP proxy server error");
            }
        }));
    }
    if let (Some(addr), Some(acceptor)) = (&config.server.secure_listen_address, tls_acceptor) {
        let addr = parse_listen_address(addr)?;
        let server = ProxyServer::new(addr, Arc::clone(&handler), shutdown_rx.clone()).with_tls(acceptor);
        server_handles.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "HTTPS proxy server error");
            }
        }));
    }

    wait_for_signal().await?;

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        for handle in server_handles {
            let _ = handle.await;
        }
    })
    .await;

    let _ = tokio::time::timeout(Duration::from_secs(1), async {
        for handle in watcher_handles {
            let _ = handle.await;
        }
    })
    .await;

    info!(
        requests = stats.get_total_requests(),
        unauthenticated = stats.get_unauthenticated(),
        forbidden = stats.get_forbidden(),
        authorization_errors = stats.get_authorization_errors(),
        upstream_failures = stats.get_upstream_failures(),
        tunnels = stats.get_tunnels(),
        mean_negotiation_ms = stats.mean_negotiation_latency().map(|d| d.as_secs_f64() * 1000.0),
        "Shutdown complete"
    );
    Ok(())
}

async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

fn parse_listen_address(addr: &str) -> anyhow::Result<SocketAddr> {
    addr.parse().map_err(|e| {
        error!(addr, error = %e, "Invalid listen address");
        anyhow::anyhow!("Invalid listen address '{}': {}", addr, e)
    })
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        insecure = ?config.server.insecure_listen_address,
        secure = ?config.server.secure_listen_address,
        upstream = %config.server.upstream,
        force_h2c = config.server.upstream_force_h2c,
        "Server configuration"
    );
    info!(
        oidc = config.proxy.authentication.oidc.enabled(),
        client_ca = ?config.proxy.authentication.client_ca_file,
        header_annotation = config.proxy.authentication.header.enabled,
        fixed_attributes = ?config.proxy.authorization.resource_attributes_file,
        cors_origins = ?config.proxy.cors.allow_origins,
        "Access control settings"
    );
}
