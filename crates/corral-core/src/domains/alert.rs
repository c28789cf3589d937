//! Alert domain: firing alerts from an Alertmanager-compatible endpoint.
//!
//! One class, `alert`. A query is a JSON map of label equalities:
//! `{"alertname":"HighLatency","namespace":"ns1"}`. The canonical form is
//! the map re-serialized with sorted keys. The store fetches all current
//! alerts and filters by label subset client-side.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use sha2::{Digest, Sha256};

use crate::constraint::Constraint;
use crate::domain::{Domain, Id, Object, Query, QueryParseError};
use crate::store::{Appender, Store, StoreError, StoreParams};

pub const DOMAIN_NAME: &str = "alert";

const CLASS_NAME: &str = "alert";

/// The alert domain.
pub struct AlertDomain;

impl AlertDomain {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AlertDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Domain for AlertDomain {
    fn name(&self) -> &str {
        DOMAIN_NAME
    }

    fn class_names(&self) -> Vec<String> {
        vec![CLASS_NAME.to_string()]
    }

    /// Identity is the alert fingerprint when present, else a hash of the
    /// sorted label set.
    fn object_id(&self, _class: &str, obj: &Object) -> Id {
        if let Some(fingerprint) = obj.field("fingerprint").and_then(|v| v.as_str()) {
            return Id::new(fingerprint);
        }
        match obj.field("labels").and_then(|v| v.as_object()) {
            Some(labels) => {
                let mut hasher = Sha256::new();
                for (k, v) in labels {
                    hasher.update(k.as_bytes());
                    hasher.update(b"=");
                    hasher.update(v.to_string().as_bytes());
                    hasher.update(b",");
                }
                Id::new(format!("{:x}", hasher.finalize()))
            }
            None => Id::hash_of(obj),
        }
    }

    fn parse_selector(&self, s: &str) -> Result<(String, String), QueryParseError> {
        let body = s.strip_prefix("alert:").unwrap_or(s).trim();
        let labels: BTreeMap<String, String> =
            serde_json::from_str(body).map_err(|e| QueryParseError::Malformed {
                domain: DOMAIN_NAME.to_string(),
                query: s.to_string(),
                reason: e.to_string(),
            })?;
        let canonical = serde_json::to_string(&labels).map_err(|e| QueryParseError::Malformed {
            domain: DOMAIN_NAME.to_string(),
            query: s.to_string(),
            reason: e.to_string(),
        })?;
        Ok((CLASS_NAME.to_string(), canonical))
    }

    fn new_store(&self, params: &StoreParams) -> Result<Arc<dyn Store>, StoreError> {
        let base_url = params.require_str(DOMAIN_NAME, "url")?;
        Ok(Arc::new(AlertmanagerStore::new(base_url)))
    }
}

// =============================================================================
// Store
// =============================================================================

/// HTTP store against an Alertmanager-compatible endpoint.
pub struct AlertmanagerStore {
    base_url: String,
    client: Client,
}

impl AlertmanagerStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Store for AlertmanagerStore {
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

        let wanted: BTreeMap<String, String> =
            serde_json::from_str(query.selector()).map_err(|e| StoreError::BadQuery {
                query: query.to_string(),
                reason: e.to_string(),
            })?;

        let url = format!("{}/api/v2/alerts", self.base_url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Unavailable(format!(
                "alert store returned {status}"
            )));
        }

        let alerts: Vec<serde_json::Value> =
            response.json().await.map_err(|e| StoreError::BadQuery {
                query: query.to_string(),
                reason: e.to_string(),
            })?;

        for alert in alerts {
            if matches_labels(&alert, &wanted) && !out.append(Object::new(alert)) {
                break;
            }
        }
        Ok(())
    }
}

/// True when every wanted label matches the alert's labels.
fn matches_labels(alert: &serde_json::Value, wanted: &BTreeMap<String, String>) -> bool {
    let Some(labels) = alert.get("labels").and_then(|v| v.as_object()) else {
        return wanted.is_empty();
    };
    wanted
        .iter()
        .all(|(k, v)| labels.get(k).and_then(|l| l.as_str()) == Some(v.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_sorts_keys() {
        let d = AlertDomain::new();
        let (class, selector) = d
            .parse_selector(r#"{"namespace":"ns1","alertname":"High"}"#)
            .unwrap();
        assert_eq!(class, "alert");
        assert_eq!(selector, r#"{"alertname":"High","namespace":"ns1"}"#);
    }

    #[test]
    fn test_fingerprint_identity() {
        let d = AlertDomain::new();
        let obj = Object::new(serde_json::json!({
            "fingerprint": "abc123", "labels": {"alertname": "High"}
        }));
        assert_eq!(d.object_id("alert", &obj), Id::new("abc123"));
    }

    #[test]
    fn test_label_matching() {
        let alert = serde_json::json!({"labels": {"alertname": "High", "ns": "a"}});
        let mut wanted = BTreeMap::new();
        wanted.insert("alertname".to_string(), "High".to_string());
        assert!(matches_labels(&alert, &wanted));

        wanted.insert("ns".to_string(), "b".to_string());
        assert!(!matches_labels(&alert, &wanted));
    }
}
