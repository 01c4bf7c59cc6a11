//! Mapping requests onto access review attributes
//!
//! Either every request is checked against one fixed resource read from a
//! file, or the resource is derived from the request path using the usual
//! `/api/{version}/...` and `/apis/{group}/{version}/...` layouts.

use crate::authn::Identity;
use crate::authz::AuthzError;
use hyper::http::request::Parts;
use hyper::Method;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// What an access review is asked about
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes {
    pub user: Identity,
    pub verb: String,
    pub namespace: String,
    pub api_group: String,
    pub api_version: String,
    pub resource: String,
    pub subresource: String,
    pub name: String,
    pub resource_request: bool,
    pub path: String,
}

/// Contents of the fixed attributes file
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceAttributes {
    pub verb: String,
    pub namespace: String,
    pub api_group: String,
    pub api_version: String,
    pub resource: String,
    pub subresource: String,
    pub name: String,
}

impl ResourceAttributes {
    pub fn load(path: &Path) -> Result<Self, AuthzError> {
        let content = std::fs::read_to_string(path).map_err(|e| AuthzError::AttributesFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| AuthzError::AttributesFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}

const API_PREFIXES: [&str; 2] = ["api", "apis"];
const GROUPLESS_API_PREFIXES: [&str; 1] = ["api"];
const SPECIAL_VERBS: [&str; 2] = ["proxy", "watch"];
const SPECIAL_VERBS_NO_SUBRESOURCES: [&str; 1] = ["proxy"];
const NAMESPACE_SUBRESOURCES: [&str; 2] = ["status", "finalize"];

/// Verb for an HTTP method; unknown methods map to an empty verb
pub fn verb_for_method(method: &Method) -> &'static str {
    match *method {
        Method::POST => "create",
        Method::GET => "get",
        Method::PUT => "update",
        Method::PATCH => "patch",
        Method::DELETE => "delete",
        _ => "",
    }
}

/// Fill resource fields from a request path. Paths outside the API layouts
/// become non-resource requests carrying the path unchanged.
pub fn parse_path(path: &str, attrs: &mut Attributes) {
    attrs.path = path.to_string();

    let parts: Vec<&str> = path.trim_matches('/').split('/').collect();
    if parts.len() < 3 || !API_PREFIXES.contains(&parts[0]) {
        return;
    }

    let prefix = parts[0];
    let mut rest = &parts[1..];

    let mut api_group = "";
    if !GROUPLESS_API_PREFIXES.contains(&prefix) {
        // prefix already consumed: need group, version and something more
        if rest.len() < 3 {
            return;
        }
        api_group = rest[0];
        rest = &rest[1..];
    }

    let api_version = rest[0];
    rest = &rest[1..];

    let mut special = "";
    if SPECIAL_VERBS.contains(&rest[0]) {
        if rest.len() < 2 {
            return;
        }
        special = rest[0];
        rest = &rest[1..];
    }

    let mut namespace = "";
    if rest[0] == "namespaces" && rest.len() > 1 {
        namespace = rest[1];
        if rest.len() > 2 && !NAMESPACE_SUBRESOURCES.contains(&rest[2]) {
            rest = &rest[2..];
        }
    }

    attrs.resource_request = true;
    attrs.api_group = api_group.to_string();
    attrs.api_version = api_version.to_string();
    attrs.namespace = namespace.to_string();
    attrs.resource = rest[0].to_string();
    if rest.len() >= 2 {
        attrs.name = rest[1].to_string();
    }
    if rest.len() >= 3 && !SPECIAL_VERBS_NO_SUBRESOURCES.contains(&special) {
        attrs.subresource = rest[2].to_string();
    }
}

/// Produces the attributes for each request
#[derive(Debug, Clone, Default)]
pub struct AttributeResolver {
    fixed: Option<PathBuf>,
}

impl AttributeResolver {
    /// Derive attributes from request paths
    pub fn from_path() -> Self {
        Self { fixed: None }
    }

    /// Use the attributes stored in `path`. The file is checked once here
    /// and then re-read on every request so edits apply immediately.
    pub fn fixed(path: impl Into<PathBuf>) -> Result<Self, AuthzError> {
        let path = path.into();
        ResourceAttributes::load(&path)?;
        Ok(Self { fixed: Some(path) })
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed.is_some()
    }

    pub fn resolve(&self, user: &Identity, req: &Parts) -> Result<Attributes, AuthzError> {
        let method_verb = verb_for_method(&req.method);

        match &self.fixed {
            Some(path) => {
                let fixed = ResourceAttributes::load(path)?;
                Ok(Attributes {
                    user: user.clone(),
                    verb: if fixed.verb.is_empty() {
                        method_verb.to_string()
                    } else {
                        fixed.verb
                    },
                    namespace: fixed.namespace,
                    api_group: fixed.api_group,
                    api_version: fixed.api_version,
                    resource: fixed.resource,
                    subresource: fixed.subresource,
                    name: fixed.name,
                    resource_request: true,
                    path: String::new(),
                })
            }
            None => {
                let mut attrs = Attributes {
                    user: user.clone(),
                    verb: method_verb.to_string(),
                    ..Attributes::default()
                };
                parse_path(req.uri.path(), &mut attrs);
                Ok(attrs)
            }
        }
    }
}
