//! Authorization through the SubjectAccessReview API

use crate::attributes::Attributes;
use crate::kube::{KubeClient, KubeError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

const SUBJECT_ACCESS_REVIEW_PATH: &str = "/apis/authorization.k8s.io/v1/subjectaccessreviews";

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("access review failed: {0}")]
    Review(#[from] KubeError),

    #[error("invalid resource attributes file {path}: {reason}")]
    AttributesFile { path: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
    /// The reviewer has no policy for the request; treated as a denial
    NoOpinion,
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Remote collaborator rendering an allow/deny decision
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Decision plus a human-readable reason
    async fn authorize(&self, attrs: &Attributes) -> Result<(Decision, String), AuthzError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubjectAccessReview<'a> {
    api_version: &'static str,
    kind: &'static str,
    spec: SubjectAccessReviewSpec<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubjectAccessReviewSpec<'a> {
    user: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    uid: &'a str,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    groups: &'a [String],
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    extra: &'a BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_attributes: Option<ResourceAttributes<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    non_resource_attributes: Option<NonResourceAttributes<'a>>,
}

#[derive(Debug, Serialize)]
struct ResourceAttributes<'a> {
    namespace: &'a str,
    verb: &'a str,
    group: &'a str,
    version: &'a str,
    resource: &'a str,
    subresource: &'a str,
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct NonResourceAttributes<'a> {
    path: &'a str,
    verb: &'a str,
}

#[derive(Debug, Deserialize)]
struct SubjectAccessReviewResponse {
    #[serde(default)]
    status: SubjectAccessReviewStatus,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SubjectAccessReviewStatus {
    allowed: bool,
    denied: bool,
    reason: String,
    evaluation_error: String,
}

impl SubjectAccessReviewStatus {
    fn decision(self) -> (Decision, String) {
        let decision = if self.allowed {
            Decision::Allow
        } else if self.denied {
            Decision::Deny
        } else {
            Decision::NoOpinion
        };

        let reason = if self.evaluation_error.is_empty() || decision.is_allowed() {
            self.reason
        } else if self.reason.is_empty() {
            self.evaluation_error
        } else {
            format!("{}: {}", self.reason, self.evaluation_error)
        };

        (decision, reason)
    }
}

fn review_spec(attrs: &Attributes) -> SubjectAccessReviewSpec<'_> {
    let (resource_attributes, non_resource_attributes) = if attrs.resource_request {
        (
            Some(ResourceAttributes {
                namespace: &attrs.namespace,
                verb: &attrs.verb,
                group: &attrs.api_group,
                version: &attrs.api_version,
                resource: &attrs.resource,
                subresource: &attrs.subresource,
                name: &attrs.name,
            }),
            None,
        )
    } else {
        (
            None,
            Some(NonResourceAttributes {
                path: &attrs.path,
                verb: &attrs.verb,
            }),
        )
    };

    SubjectAccessReviewSpec {
        user: &attrs.user.name,
        uid: &attrs.user.uid,
        groups: &attrs.user.groups,
        extra: &attrs.user.extra,
        resource_attributes,
        non_resource_attributes,
    }
}

#[async_trait]
impl Authorizer for KubeClient {
    async fn authorize(&self, attrs: &Attributes) -> Result<(Decision, String), AuthzError> {
        let review = SubjectAccessReview {
            api_version: "authorization.k8s.io/v1",
            kind: "SubjectAccessReview",
            spec: review_spec(attrs),
        };
        let response: SubjectAccessReviewResponse =
            self.create(SUBJECT_ACCESS_REVIEW_PATH, &review).await?;
        Ok(response.status.decision())
    }
}
