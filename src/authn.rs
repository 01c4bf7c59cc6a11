//! Request authentication
//!
//! Each strategy answers one of three ways: an identity, "not applicable"
//! (`Ok(None)`, the credential it understands is absent), or an error. The
//! [`AuthenticatorChain`] tries strategies in order and stops at the first
//! identity.

use crate::kube::KubeError;
use crate::reload::{Cancelable, CancelableReloader};
use async_trait::async_trait;
use hyper::header::AUTHORIZATION;
use hyper::http::request::Parts;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Authenticated user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub uid: String,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

impl Identity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Error)]
pub enum AuthnError {
    #[error("invalid bearer token: {0}")]
    InvalidToken(String),

    #[error("token rejected by token review: {0}")]
    Rejected(String),

    #[error("invalid client certificate: {0}")]
    InvalidCertificate(String),

    #[error("signing keys for issuer {0} are not available yet")]
    KeysUnavailable(String),

    #[error("token review failed: {0}")]
    Review(#[from] KubeError),
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, req: &Parts) -> Result<Option<Identity>, AuthnError>;
}

#[async_trait]
impl<T: Authenticator + ?Sized> Authenticator for Arc<T> {
    async fn authenticate(&self, req: &Parts) -> Result<Option<Identity>, AuthnError> {
        (**self).authenticate(req).await
    }
}

/// Authenticates with whichever instance is current when the request arrives.
#[async_trait]
impl<V> Authenticator for CancelableReloader<V>
where
    V: Authenticator + Cancelable + Clone + Send + Sync + 'static,
{
    async fn authenticate(&self, req: &Parts) -> Result<Option<Identity>, AuthnError> {
        let current = self.get();
        current.authenticate(req).await
    }
}

/// Bearer token from the Authorization header, if any
pub fn bearer_token(req: &Parts) -> Option<&str> {
    let value = req.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Ordered list of strategies with fallback on error
#[derive(Default)]
pub struct AuthenticatorChain {
    strategies: Vec<(String, Box<dyn Authenticator>)>,
}

impl AuthenticatorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, strategy: impl Authenticator + 'static) {
        self.strategies.push((name.into(), Box::new(strategy)));
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.strategies.iter().map(|(name, _)| name.as_str()).collect()
    }
}

#[async_trait]
impl Authenticator for AuthenticatorChain {
    /// The first identity wins. "Not applicable" moves on to the next
    /// strategy, and so does an error unless it came from the last one.
    async fn authenticate(&self, req: &Parts) -> Result<Option<Identity>, AuthnError> {
        let last = self.strategies.len().saturating_sub(1);

        for (i, (name, strategy)) in self.strategies.iter().enumerate() {
            match strategy.authenticate(req).await {
                Ok(Some(identity)) => {
                    debug!(strategy = %name, user = %identity.name, "Authenticated");
                    return Ok(Some(identity));
                }
                Ok(None) => continue,
                Err(e) if i < last => {
                    warn!(strategy = %name, error = %e, "Authentication failed, trying next strategy");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }
}
