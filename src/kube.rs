//! Minimal client for the cluster API server
//!
//! Only what the proxy needs: POSTing review objects with the service
//! account's bearer token and decoding the returned status.

use crate::config::KubernetesConfig;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Error)]
pub enum KubeError {
    #[error("not running in a cluster: {0} is not set")]
    NotInCluster(&'static str),

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid CA bundle {path}: {reason}")]
    InvalidCa { path: String, reason: String },

    #[error("request to API server failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API server returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Build an HTTP client trusting the certificates in `ca_file` in addition
/// to the bundled web roots.
pub fn http_client(ca_file: Option<&str>) -> Result<reqwest::Client, KubeError> {
    let mut builder = reqwest::Client::builder().use_rustls_tls();

    if let Some(path) = ca_file {
        let certs = crate::tls::load_certs(path).map_err(|e| KubeError::InvalidCa {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        for cert in certs {
            let cert = reqwest::Certificate::from_der(cert.as_ref()).map_err(|e| {
                KubeError::InvalidCa {
                    path: path.to_string(),
                    reason: e.to_string(),
                }
            })?;
            builder = builder.add_root_certificate(cert);
        }
    }

    Ok(builder.build()?)
}

pub struct KubeClient {
    base_url: String,
    token_file: Option<PathBuf>,
    http: reqwest::Client,
}

impl std::fmt::Debug for KubeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClient")
            .field("base_url", &self.base_url)
            .field("token_file", &self.token_file)
            .finish()
    }
}

impl KubeClient {
    /// Connect using explicit settings, falling back to the in-cluster
    /// service account for anything left unset.
    pub fn new(config: &KubernetesConfig) -> Result<Self, KubeError> {
        let base_url = match &config.api_server {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => in_cluster_url()?,
        };

        let token_file = match &config.token_file {
            Some(path) => Some(PathBuf::from(path)),
            None if config.api_server.is_none() => Some(PathBuf::from(SERVICE_ACCOUNT_DIR).join("token")),
            None => None,
        };

        let ca_file = match &config.ca_file {
            Some(path) => Some(path.clone()),
            None if config.api_server.is_none() => {
                Some(format!("{}/ca.crt", SERVICE_ACCOUNT_DIR))
            }
            None => None,
        };

        let http = http_client(ca_file.as_deref())?;
        debug!(api_server = %base_url, "Kubernetes client configured");

        Ok(Self {
            base_url,
            token_file,
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST `body` to `path` and decode the created object.
    ///
    /// The token file is read on every call since projected service account
    /// tokens are rotated on disk.
    pub async fn create<T, R>(&self, path: &str, body: &T) -> Result<R, KubeError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.post(&url).json(body);

        if let Some(token_file) = &self.token_file {
            let token = std::fs::read_to_string(token_file).map_err(|source| KubeError::Io {
                path: token_file.display().to_string(),
                source,
            })?;
            request = request.bearer_auth(token.trim());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KubeError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

fn in_cluster_url() -> Result<String, KubeError> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST")
        .map_err(|_| KubeError::NotInCluster("KUBERNETES_SERVICE_HOST"))?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT")
        .map_err(|_| KubeError::NotInCluster("KUBERNETES_SERVICE_PORT"))?;

    // IPv6 hosts need brackets in a URL
    if host.contains(':') {
        Ok(format!("https://[{}]:{}", host, port))
    } else {
        Ok(format!("https://{}:{}", host, port))
    }
}
