//! Delegated bearer token authentication through the TokenReview API

use crate::authn::{bearer_token, Authenticator, AuthnError, Identity};
use crate::kube::KubeClient;
use async_trait::async_trait;
use hyper::http::request::Parts;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const TOKEN_REVIEW_PATH: &str = "/apis/authentication.k8s.io/v1/tokenreviews";

/// Remote collaborator that decides whether a token is valid
#[async_trait]
pub trait TokenReviewer: Send + Sync {
    async fn review(&self, token: &str) -> Result<TokenReviewStatus, AuthnError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenReview<'a> {
    api_version: &'static str,
    kind: &'static str,
    spec: TokenReviewSpec<'a>,
}

#[derive(Debug, Serialize)]
struct TokenReviewSpec<'a> {
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenReviewResponse {
    #[serde(default)]
    status: TokenReviewStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenReviewStatus {
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub user: UserInfo,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserInfo {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, Vec<String>>,
}

impl From<UserInfo> for Identity {
    fn from(user: UserInfo) -> Self {
        Identity {
            name: user.username,
            uid: user.uid,
            groups: user.groups,
            extra: user.extra,
        }
    }
}

#[async_trait]
impl TokenReviewer for KubeClient {
    async fn review(&self, token: &str) -> Result<TokenReviewStatus, AuthnError> {
        let review = TokenReview {
            api_version: "authentication.k8s.io/v1",
            kind: "TokenReview",
            spec: TokenReviewSpec { token },
        };
        let response: TokenReviewResponse = self.create(TOKEN_REVIEW_PATH, &review).await?;
        Ok(response.status)
    }
}

/// Authenticates bearer tokens by asking the API server about them
pub struct TokenReviewAuthenticator {
    reviewer: Arc<dyn TokenReviewer>,
}

impl TokenReviewAuthenticator {
    pub fn new(reviewer: Arc<dyn TokenReviewer>) -> Self {
        Self { reviewer }
    }
}

#[async_trait]
impl Authenticator for TokenReviewAuthenticator {
    async fn authenticate(&self, req: &Parts) -> Result<Option<Identity>, AuthnError> {
        let Some(token) = bearer_token(req) else {
            return Ok(None);
        };

        let status = self.reviewer.review(token).await?;
        if !status.authenticated {
            debug!(error = %status.error, "Token review rejected token");
            let reason = if status.error.is_empty() {
                "token not authenticated".to_string()
            } else {
                status.error
            };
            return Err(AuthnError::Rejected(reason));
        }

        Ok(Some(status.user.into()))
    }
}
