//! OIDC bearer token authentication
//!
//! Tokens are verified locally against the issuer's published signing keys.
//! A background task discovers the key set URL and refetches the keys
//! periodically; it lives until the authenticator is canceled or dropped.

use crate::authn::{bearer_token, Authenticator, AuthnError, Identity};
use crate::config::OidcConfig;
use crate::kube::http_client;
use crate::reload::Cancelable;
use async_trait::async_trait;
use hyper::http::request::Parts;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Retry delay while no keys have been fetched yet
const INITIAL_RETRY: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct Discovery {
    issuer: String,
    jwks_uri: String,
}

pub struct OidcAuthenticator {
    issuer: String,
    client_id: String,
    username_claim: String,
    groups_claim: String,
    groups_prefix: String,
    algorithms: Vec<Algorithm>,
    keys: Arc<RwLock<Option<JwkSet>>>,
    cancel_tx: watch::Sender<bool>,
    refresh: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for OidcAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcAuthenticator")
            .field("issuer", &self.issuer)
            .field("client_id", &self.client_id)
            .field("algorithms", &self.algorithms)
            .finish()
    }
}

impl OidcAuthenticator {
    /// Build an authenticator and start fetching the issuer's keys.
    ///
    /// Reads `ca_file`, so a rotated CA produces a different client. Must be
    /// called from within a Tokio runtime.
    pub fn new(config: &OidcConfig) -> anyhow::Result<Arc<Self>> {
        let issuer = config
            .issuer_url
            .clone()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| anyhow::anyhow!("OIDC issuer URL is not configured"))?;
        if !issuer.starts_with("https://") {
            anyhow::bail!("OIDC issuer URL must use https: {}", issuer);
        }

        let algorithms = config
            .supported_signing_algs
            .iter()
            .map(|alg| {
                Algorithm::from_str(alg)
                    .map_err(|_| anyhow::anyhow!("unsupported OIDC signing algorithm '{}'", alg))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let http = http_client(config.ca_file.as_deref())?;
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let authenticator = Arc::new(Self {
            issuer: issuer.clone(),
            client_id: config.client_id.clone(),
            username_claim: config.username_claim.clone(),
            groups_claim: config.groups_claim.clone(),
            groups_prefix: config.groups_prefix.clone(),
            algorithms,
            keys: Arc::new(RwLock::new(None)),
            cancel_tx,
            refresh: Mutex::new(None),
        });

        let handle = tokio::spawn(refresh_keys(
            http,
            issuer,
            authenticator.keys.clone(),
            config.key_refresh_interval(),
            cancel_rx,
        ));
        *authenticator.refresh.lock() = Some(handle);

        info!(issuer = %authenticator.issuer, client_id = %authenticator.client_id, "OIDC authenticator created");
        Ok(authenticator)
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn is_canceled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    pub fn has_keys(&self) -> bool {
        self.keys.read().is_some()
    }

    /// Verify signature and standard claims, then map the claims to a user.
    pub fn verify(&self, token: &str) -> Result<Identity, AuthnError> {
        let header = decode_header(token).map_err(|e| AuthnError::InvalidToken(e.to_string()))?;
        if !self.algorithms.contains(&header.alg) {
            return Err(AuthnError::InvalidToken(format!(
                "signing algorithm {:?} is not allowed",
                header.alg
            )));
        }

        let key = {
            let keys = self.keys.read();
            let set = keys
                .as_ref()
                .ok_or_else(|| AuthnError::KeysUnavailable(self.issuer.clone()))?;
            let jwk = match header.kid.as_deref() {
                Some(kid) => set.find(kid),
                None => set.keys.first(),
            }
            .ok_or_else(|| AuthnError::InvalidToken("no matching signing key".to_string()))?;
            DecodingKey::from_jwk(jwk).map_err(|e| AuthnError::InvalidToken(e.to_string()))?
        };

        // Every listed algorithm has to match the key family, so only the
        // token's own (already allowed) algorithm is passed on.
        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.client_id]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        let data = decode::<Map<String, Value>>(token, &key, &validation)
            .map_err(|e| AuthnError::InvalidToken(e.to_string()))?;

        self.identity_from_claims(&data.claims)
    }

    fn identity_from_claims(&self, claims: &Map<String, Value>) -> Result<Identity, AuthnError> {
        let name = claims
            .get(&self.username_claim)
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                AuthnError::InvalidToken(format!("claim '{}' is missing", self.username_claim))
            })?;

        if self.username_claim == "email" {
            if let Some(Value::Bool(false)) = claims.get("email_verified") {
                return Err(AuthnError::InvalidToken("email is not verified".to_string()));
            }
        }

        let groups = match claims.get(&self.groups_claim) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::String(group)) => vec![group.clone()],
            Some(Value::Array(values)) => values
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_string).ok_or_else(|| {
                        AuthnError::InvalidToken(format!("claim '{}' is not a list of strings", self.groups_claim))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(AuthnError::InvalidToken(format!(
                    "claim '{}' is not a string or list of strings",
                    self.groups_claim
                )))
            }
        };

        let groups = groups
            .into_iter()
            .map(|g| format!("{}{}", self.groups_prefix, g))
            .collect::<Vec<_>>();

        let uid = claims
            .get("sub")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(Identity {
            name: name.to_string(),
            uid,
            groups,
            ..Identity::default()
        })
    }

    #[cfg(test)]
    fn set_keys(&self, keys: JwkSet) {
        *self.keys.write() = Some(keys);
    }
}

impl Cancelable for OidcAuthenticator {
    fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
        debug!(issuer = %self.issuer, "OIDC authenticator canceled");
    }
}

#[async_trait]
impl Authenticator for OidcAuthenticator {
    async fn authenticate(&self, req: &Parts) -> Result<Option<Identity>, AuthnError> {
        let Some(token) = bearer_token(req) else {
            return Ok(None);
        };
        self.verify(token).map(Some)
    }
}

async fn fetch_keys(http: &reqwest::Client, issuer: &str) -> anyhow::Result<JwkSet> {
    let discovery_url = format!("{}/.well-known/openid-configuration", issuer.trim_end_matches('/'));
    let discovery: Discovery = http
        .get(&discovery_url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    if discovery.issuer != issuer {
        anyhow::bail!(
            "issuer mismatch: configured '{}', discovery document says '{}'",
            issuer,
            discovery.issuer
        );
    }

    let keys: JwkSet = http
        .get(&discovery.jwks_uri)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    Ok(keys)
}

async fn refresh_keys(
    http: reqwest::Client,
    issuer: String,
    keys: Arc<RwLock<Option<JwkSet>>>,
    interval: Duration,
    mut cancel: watch::Receiver<bool>,
) {
    let mut delay = Duration::ZERO;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.changed() => {
                debug!(issuer = %issuer, "Key refresh stopped");
                return;
            }
        }

        match fetch_keys(&http, &issuer).await {
            Ok(set) => {
                debug!(issuer = %issuer, keys = set.keys.len(), "Fetched signing keys");
                *keys.write() = Some(set);
                delay = interval;
            }
            Err(e) => {
                warn!(issuer = %issuer, error = %e, "Failed to fetch signing keys");
                delay = if keys.read().is_some() { interval } else { INITIAL_RETRY };
            }
        }
    }
}
