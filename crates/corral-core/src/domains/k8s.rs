//! Kubernetes domain: resources addressed by API paths.
//!
//! Queries are API-server paths, e.g.
//! `/api/v1/namespaces/ns1/pods?labelSelector=app=a,tier=web` or
//! `/apis/apps/v1/namespaces/ns1/deployments/web`. The canonical form
//! sorts selector keys, so label order never affects query identity.
//!
//! The store is a thin HTTP client against the API server; it expects the
//! usual `List` response shape and fills in per-item `apiVersion`/`kind`
//! when the list omits them.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::constraint::Constraint;
use crate::domain::{Class, Domain, Id, Object, Query, QueryParseError};
use crate::rule::{Rule, RuleError};
use crate::store::{Appender, Store, StoreError, StoreParams};

pub const DOMAIN_NAME: &str = "k8s";

/// Kind, API group ("" for core), version, resource (plural) for every
/// class this domain serves.
const KINDS: &[(&str, &str, &str, &str)] = &[
    ("Pod", "", "v1", "pods"),
    ("Service", "", "v1", "services"),
    ("ReplicationController", "", "v1", "replicationcontrollers"),
    ("Event", "", "v1", "events"),
    ("Node", "", "v1", "nodes"),
    ("Namespace", "", "v1", "namespaces"),
    ("Deployment", "apps", "v1", "deployments"),
    ("ReplicaSet", "apps", "v1", "replicasets"),
    ("StatefulSet", "apps", "v1", "statefulsets"),
    ("DaemonSet", "apps", "v1", "daemonsets"),
    ("Job", "batch", "v1", "jobs"),
    ("PodDisruptionBudget", "policy", "v1", "poddisruptionbudgets"),
];

/// Workload kinds carrying `spec.selector.matchLabels`, used by the
/// built-in PodSelector rule.
const SELECTOR_KINDS: &[&str] = &[
    "Deployment",
    "ReplicaSet",
    "StatefulSet",
    "DaemonSet",
    "Job",
    "ReplicationController",
    "Service",
    "PodDisruptionBudget",
];

/// The Kubernetes domain.
pub struct K8sDomain;

impl K8sDomain {
    pub fn new() -> Self {
        Self
    }

    fn kind_info(kind: &str) -> Option<(&'static str, &'static str, &'static str)> {
        KINDS
            .iter()
            .find(|(k, _, _, _)| *k == kind)
            .map(|(_, group, version, resource)| (*group, *version, *resource))
    }

    fn kind_for_resource(resource: &str) -> Option<&'static str> {
        KINDS
            .iter()
            .find(|(_, _, _, r)| *r == resource)
            .map(|(kind, _, _, _)| *kind)
    }
}

impl Default for K8sDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Domain for K8sDomain {
    fn name(&self) -> &str {
        DOMAIN_NAME
    }

    fn class_names(&self) -> Vec<String> {
        KINDS.iter().map(|(kind, _, _, _)| kind.to_string()).collect()
    }

    fn object_id(&self, class: &str, obj: &Object) -> Id {
        let api_version = obj
            .field("apiVersion")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let kind = obj.field("kind").and_then(|v| v.as_str()).unwrap_or(class);
        let namespace = obj
            .field("metadata.namespace")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let name = obj
            .field("metadata.name")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let uid = obj
            .field("metadata.uid")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if name.is_empty() && uid.is_empty() {
            return Id::hash_of(obj);
        }
        Id::new(format!("{api_version}/{kind}/{namespace}/{name}/{uid}"))
    }

    fn parse_selector(&self, s: &str) -> Result<(String, String), QueryParseError> {
        // Accept both `Kind:/path` and the bare path.
        let path = match s.split_once(':') {
            Some((kind, rest)) if Self::kind_info(kind).is_some() => rest,
            _ => s,
        };
        let parts = PathParts::parse(path).map_err(|reason| QueryParseError::Malformed {
            domain: DOMAIN_NAME.to_string(),
            query: s.to_string(),
            reason,
        })?;
        Ok((parts.kind.to_string(), parts.to_path()))
    }

    fn new_store(&self, params: &StoreParams) -> Result<Arc<dyn Store>, StoreError> {
        K8sStore::from_params(params).map(|s| Arc::new(s) as Arc<dyn Store>)
    }
}

/// A parsed API path.
struct PathParts {
    kind: &'static str,
    group: &'static str,
    version: &'static str,
    resource: &'static str,
    namespace: Option<String>,
    name: Option<String>,
    label_selector: BTreeMap<String, String>,
    field_selector: BTreeMap<String, String>,
}

impl PathParts {
    fn parse(path: &str) -> Result<Self, String> {
        let (path, params) = match path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (path, None),
        };

        let segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        // /api/v1/... (core) or /apis/<group>/<version>/...
        let (group, version, rest) = match segments.as_slice() {
            ["api", version, rest @ ..] => ("", *version, rest),
            ["apis", group, version, rest @ ..] => (*group, *version, rest),
            _ => return Err("path must start with /api/<version> or /apis/<group>/<version>".into()),
        };

        let (namespace, resource, name) = match rest {
            ["namespaces", ns, resource] => (Some(ns.to_string()), *resource, None),
            ["namespaces", ns, resource, name] => {
                (Some(ns.to_string()), *resource, Some(name.to_string()))
            }
            // A bare `/api/v1/namespaces` or `/api/v1/namespaces/<name>`
            // addresses the Namespace resource itself.
            ["namespaces"] => (None, "namespaces", None),
            ["namespaces", name] => (None, "namespaces", Some(name.to_string())),
            [resource] => (None, *resource, None),
            [resource, name] => (None, *resource, Some(name.to_string())),
            _ => return Err("unrecognized resource path".into()),
        };

        let kind = K8sDomain::kind_for_resource(resource)
            .ok_or_else(|| format!("unknown resource {resource:?}"))?;
        let (canon_group, canon_version, canon_resource) = K8sDomain::kind_info(kind)
            .ok_or_else(|| format!("unknown kind {kind:?}"))?;
        if canon_group != group || canon_version != version {
            return Err(format!(
                "resource {canon_resource:?} belongs to {canon_group:?}/{canon_version:?}"
            ));
        }

        let mut label_selector = BTreeMap::new();
        let mut field_selector = BTreeMap::new();
        if let Some(params) = params {
            for (key, value) in url::form_urlencoded::parse(params.as_bytes()) {
                let target = match key.as_ref() {
                    "labelSelector" => &mut label_selector,
                    "fieldSelector" => &mut field_selector,
                    other => return Err(format!("unsupported query parameter {other:?}")),
                };
                for pair in value.split(',').filter(|p| !p.is_empty()) {
                    let (k, v) = pair
                        .split_once('=')
                        .ok_or_else(|| format!("malformed selector term {pair:?}"))?;
                    target.insert(k.to_string(), v.to_string());
                }
            }
        }

        Ok(Self {
            kind,
            group: canon_group,
            version: canon_version,
            resource: canon_resource,
            namespace,
            name,
            label_selector,
            field_selector,
        })
    }

    /// Canonical path: selector keys sorted, percent-decoding normalized.
    fn to_path(&self) -> String {
        let mut path = if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        };
        if self.resource == "namespaces" {
            path.push_str("/namespaces");
        } else {
            if let Some(ns) = &self.namespace {
                let _ = write!(path, "/namespaces/{ns}");
            }
            let _ = write!(path, "/{}", self.resource);
        }
        if let Some(name) = &self.name {
            let _ = write!(path, "/{name}");
        }

        let mut params = Vec::new();
        if !self.label_selector.is_empty() {
            params.push(format!("labelSelector={}", join_selector(&self.label_selector)));
        }
        if !self.field_selector.is_empty() {
            params.push(format!("fieldSelector={}", join_selector(&self.field_selector)));
        }
        if !params.is_empty() {
            let _ = write!(path, "?{}", params.join("&"));
        }
        path
    }
}

fn join_selector(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

// =============================================================================
// Store
// =============================================================================

/// HTTP store against a Kubernetes API server.
pub struct K8sStore {
    base_url: String,
    token: Option<String>,
    client: Client,
}

impl K8sStore {
    fn from_params(params: &StoreParams) -> Result<Self, StoreError> {
        let base_url = params.require_str(DOMAIN_NAME, "url")?;
        let token = params.get_str("token");
        let insecure = params.get_bool("insecure_skip_verify").unwrap_or(false);

        let client = Client::builder()
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(|e| StoreError::BadParams {
                domain: DOMAIN_NAME.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    items: Vec<serde_json::Value>,
}

#[async_trait]
impl Store for K8sStore {
    fn domain_name(&self) -> &str {
        DOMAIN_NAME
    }

    async fn get(
        &self,
        query: &Query,
        _constraint: &Constraint,
        out: &mut dyn Appender,
    ) -> Result<(), StoreError> {
        if query.class().domain_name() != DOMAIN_NAME {
            return Err(StoreError::ClassMismatch {
                domain: DOMAIN_NAME.to_string(),
                class: query.class().full_name(),
            });
        }

        let url = format!("{}{}", self.base_url, query.selector());
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 404 || status.as_u16() == 400 {
            return Err(StoreError::BadQuery {
                query: query.to_string(),
                reason: format!("API server returned {status}"),
            });
        }
        if !status.is_success() {
            return Err(StoreError::Unavailable(format!(
                "API server returned {status}"
            )));
        }

        let body: serde_json::Value = response.json().await?;
        let kind = query.class().name().to_string();
        let api_version = api_version_for(&kind);

        // A single-object path returns the object itself, not a list.
        let items = if body.get("items").is_some() {
            serde_json::from_value::<ListResponse>(body)
                .map_err(|e| StoreError::BadQuery {
                    query: query.to_string(),
                    reason: e.to_string(),
                })?
                .items
        } else {
            vec![body]
        };

        for mut item in items {
            if let Some(map) = item.as_object_mut() {
                map.entry("kind".to_string())
                    .or_insert_with(|| serde_json::Value::String(kind.clone()));
                map.entry("apiVersion".to_string())
                    .or_insert_with(|| serde_json::Value::String(api_version.clone()));
            }
            if !out.append(Object::new(item)) {
                break;
            }
        }
        Ok(())
    }
}

fn api_version_for(kind: &str) -> String {
    match K8sDomain::kind_info(kind) {
        Some(("", version, _)) => version.to_string(),
        Some((group, version, _)) => format!("{group}/{version}"),
        None => "v1".to_string(),
    }
}

// =============================================================================
// Built-in rules
// =============================================================================

/// The PodSelector rule: every workload kind with a pod selector maps to
/// the pods it selects, label keys in sorted order. Objects without
/// `spec.selector.matchLabels` guard out.
pub fn selector_rules(domain: &Arc<dyn Domain>) -> Result<Vec<Rule>, RuleError> {
    let start: Vec<Class> = SELECTOR_KINDS
        .iter()
        .map(|kind| Class::new(Arc::clone(domain), *kind))
        .collect();
    let goal = vec![Class::new(Arc::clone(domain), "Pod")];
    let template = "{% if spec.selector.matchLabels %}\
/api/v1/namespaces/{{ metadata.namespace }}/pods?labelSelector=\
{% for k, v in spec.selector.matchLabels|dictsort %}{{ k }}={{ v }}{% if not loop.last %},{% endif %}{% endfor %}\
{% endif %}";
    Ok(vec![Rule::new("PodSelector", start, goal, template)?])
}
