use hyper::header::HeaderName;
use hyper::Uri;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and upstream configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// How to reach the cluster API server for token and access reviews
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// Authentication, authorization, CORS and TLS settings
    #[serde(flatten)]
    pub proxy: ProxyConfig,
}

/// Settings consumed by the request path.
///
/// `Clone` produces a fully independent deep copy; the server keeps its own
/// copy so nothing that mutates the loaded [`Config`] afterwards is observed
/// while requests are served.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub authentication: AuthnConfig,

    #[serde(default)]
    pub authorization: AuthzConfig,

    #[serde(default)]
    pub cors: CorsConfig,

    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Address of the plain HTTP listener (HTTP/1.1 and HTTP/2 prior knowledge)
    pub insecure_listen_address: Option<String>,

    /// Address of the HTTPS listener
    pub secure_listen_address: Option<String>,

    /// Upstream URL requests are proxied to once authenticated and authorized
    #[serde(default)]
    pub upstream: String,

    /// Speak HTTP/2 cleartext to the upstream without an upgrade handshake.
    /// Required when the upstream only speaks h2c (e.g. an insecure gRPC server).
    #[serde(default)]
    pub upstream_force_h2c: bool,

    /// CA bundle used to verify an https upstream (default: webpki roots)
    pub upstream_ca_file: Option<String>,

    /// Quiet window in milliseconds used to coalesce credential file events
    #[serde(default = "default_watch_min_delay")]
    pub watch_min_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            insecure_listen_address: None,
            secure_listen_address: None,
            upstream: String::new(),
            upstream_force_h2c: false,
            upstream_ca_file: None,
            watch_min_delay_ms: default_watch_min_delay(),
        }
    }
}

impl ServerConfig {
    pub fn watch_min_delay(&self) -> Duration {
        Duration::from_millis(self.watch_min_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    /// Server certificate (PEM, CA certificates may be concatenated after it)
    pub cert_file: Option<String>,

    /// Private key matching `cert_file` (PEM)
    pub key_file: Option<String>,

    /// Minimum TLS version: "VersionTLS12" or "VersionTLS13"
    #[serde(default = "default_tls_min_version")]
    pub min_version: String,

    /// IANA cipher suite names; empty means the provider defaults
    #[serde(default)]
    pub cipher_suites: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_file: None,
            key_file: None,
            min_version: default_tls_min_version(),
            cipher_suites: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthnConfig {
    /// CA bundle for client certificates. Requests presenting a certificate
    /// signed by one of these authorities are authenticated as its CommonName.
    pub client_ca_file: Option<String>,

    #[serde(default)]
    pub header: HeaderConfig,

    #[serde(default)]
    pub oidc: OidcConfig,
}

/// Identity headers added to requests sent upstream
#[derive(Debug, Deserialize, Clone)]
pub struct HeaderConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_user_field_name")]
    pub user_field_name: String,

    #[serde(default = "default_groups_field_name")]
    pub groups_field_name: String,

    #[serde(default = "default_group_separator")]
    pub group_separator: String,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_field_name: default_user_field_name(),
            groups_field_name: default_groups_field_name(),
            group_separator: default_group_separator(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OidcConfig {
    /// Issuer URL (https only). When set, bearer tokens are verified locally
    /// instead of through a TokenReview.
    pub issuer_url: Option<String>,

    /// Expected audience of the token
    #[serde(default)]
    pub client_id: String,

    #[serde(default = "default_username_claim")]
    pub username_claim: String,

    #[serde(default = "default_groups_claim")]
    pub groups_claim: String,

    /// Prepended to every group to avoid clashes with other strategies
    #[serde(default)]
    pub groups_prefix: String,

    #[serde(default = "default_signing_algs")]
    pub supported_signing_algs: Vec<String>,

    /// CA bundle used to reach the issuer (default: webpki roots)
    pub ca_file: Option<String>,

    /// How often the issuer's signing keys are refetched
    #[serde(default = "default_key_refresh_interval")]
    pub key_refresh_interval_secs: u64,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            issuer_url: None,
            client_id: String::new(),
            username_claim: default_username_claim(),
            groups_claim: default_groups_claim(),
            groups_prefix: String::new(),
            supported_signing_algs: default_signing_algs(),
            ca_file: None,
            key_refresh_interval_secs: default_key_refresh_interval(),
        }
    }
}

impl OidcConfig {
    pub fn enabled(&self) -> bool {
        self.issuer_url.as_deref().is_some_and(|url| !url.is_empty())
    }

    pub fn key_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.key_refresh_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthzConfig {
    /// File holding a fixed set of resource attributes used for every access
    /// review. Without it, attributes are derived from the request path.
    pub resource_attributes_file: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    /// Allowed origins; empty disables CORS handling entirely
    #[serde(default)]
    pub allow_origins: Vec<String>,

    #[serde(default = "default_cors_methods")]
    pub allow_methods: Vec<String>,

    #[serde(default = "default_cors_headers")]
    pub allow_headers: Vec<String>,

    #[serde(default)]
    pub allow_credentials: bool,

    #[serde(default = "default_cors_max_age")]
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origins: Vec::new(),
            allow_methods: default_cors_methods(),
            allow_headers: default_cors_headers(),
            allow_credentials: false,
            max_age_secs: default_cors_max_age(),
        }
    }
}

/// Connection to the cluster API server. Unset fields fall back to the
/// in-cluster service account.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct KubernetesConfig {
    pub api_server: Option<String>,
    pub token_file: Option<String>,
    pub ca_file: Option<String>,
}

// Default value functions
fn default_watch_min_delay() -> u64 {
    1000
}

fn default_tls_min_version() -> String {
    "VersionTLS12".to_string()
}

fn default_user_field_name() -> String {
    "x-remote-user".to_string()
}

fn default_groups_field_name() -> String {
    "x-remote-groups".to_string()
}

fn default_group_separator() -> String {
    "|".to_string()
}

fn default_username_claim() -> String {
    "email".to_string()
}

fn default_groups_claim() -> String {
    "groups".to_string()
}

fn default_signing_algs() -> Vec<String> {
    vec!["RS256".to_string()]
}

fn default_key_refresh_interval() -> u64 {
    300 // 5 minutes
}

fn default_cors_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_cors_headers() -> Vec<String> {
    vec!["Authorization".to_string(), "Content-Type".to_string()]
}

fn default_cors_max_age() -> u64 {
    86400
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parsed upstream URL. Only valid after [`Config::validate`] succeeded.
    pub fn upstream_uri(&self) -> anyhow::Result<Uri> {
        let uri: Uri = self.server.upstream.parse()?;
        Ok(uri)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.insecure_listen_address.is_none()
            && self.server.secure_listen_address.is_none()
        {
            errors.push("at least one of 'insecure_listen_address' or 'secure_listen_address' must be set".to_string());
        }

        match self.server.upstream.parse::<Uri>() {
            Ok(uri) => {
                if !matches!(uri.scheme_str(), Some("http") | Some("https")) {
                    errors.push(format!(
                        "'upstream' must use http or https, got '{}'",
                        self.server.upstream
                    ));
                }
                if uri.authority().is_none() {
                    errors.push(format!("'upstream' has no host: '{}'", self.server.upstream));
                }
            }
            Err(e) => errors.push(format!("invalid 'upstream' URL '{}': {}", self.server.upstream, e)),
        }

        if self.server.watch_min_delay_ms == 0 {
            errors.push("'watch_min_delay_ms' must be greater than 0".to_string());
        }

        let tls = &self.proxy.tls;
        if tls.cert_file.is_some() != tls.key_file.is_some() {
            errors.push("'tls.cert_file' and 'tls.key_file' must be set together".to_string());
        }

        let oidc = &self.proxy.authentication.oidc;
        if oidc.enabled() {
            let issuer = oidc.issuer_url.as_deref().unwrap_or_default();
            if !issuer.starts_with("https://") {
                errors.push(format!("'oidc.issuer_url' must use https, got '{}'", issuer));
            }
            if oidc.client_id.is_empty() {
                errors.push("'oidc.client_id' is required when 'oidc.issuer_url' is set".to_string());
            }
            if oidc.supported_signing_algs.is_empty() {
                errors.push("'oidc.supported_signing_algs' must not be empty".to_string());
            }
            if oidc.key_refresh_interval_secs == 0 {
                errors.push("'oidc.key_refresh_interval_secs' must be greater than 0".to_string());
            }
        }

        let header = &self.proxy.authentication.header;
        if header.enabled {
            for name in [&header.user_field_name, &header.groups_field_name] {
                if HeaderName::from_bytes(name.as_bytes()).is_err() {
                    errors.push(format!("invalid header field name '{}'", name));
                }
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
