//! Metric domain: Prometheus time series.
//!
//! One class, `metric`. Queries are PromQL expressions, typically instant
//! selectors like `up{job="api"}`. The canonical form is the trimmed
//! expression; the store evaluates it with `/api/v1/query` at the
//! constraint's end time.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::constraint::Constraint;
use crate::domain::{Domain, Id, Object, Query, QueryParseError};
use crate::store::{Appender, Store, StoreError, StoreParams};

pub const DOMAIN_NAME: &str = "metric";

const CLASS_NAME: &str = "metric";

/// The metric domain.
pub struct MetricDomain;

impl MetricDomain {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MetricDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Domain for MetricDomain {
    fn name(&self) -> &str {
        DOMAIN_NAME
    }

    fn class_names(&self) -> Vec<String> {
        vec![CLASS_NAME.to_string()]
    }

    /// Identity is the fully-labeled series: sorted label pairs.
    fn object_id(&self, _class: &str, obj: &Object) -> Id {
        match obj.field("metric").and_then(|v| v.as_object()) {
            Some(labels) => {
                let pairs: Vec<String> = labels
                    .iter()
                    .map(|(k, v)| format!("{k}={}", v.as_str().unwrap_or_default()))
                    .collect();
                Id::new(pairs.join(","))
            }
            None => Id::hash_of(obj),
        }
    }

    fn parse_selector(&self, s: &str) -> Result<(String, String), QueryParseError> {
        let expr = s.strip_prefix("metric:").unwrap_or(s).trim();
        if expr.is_empty() {
            return Err(QueryParseError::Malformed {
                domain: DOMAIN_NAME.to_string(),
                query: s.to_string(),
                reason: "empty PromQL expression".to_string(),
            });
        }
        Ok((CLASS_NAME.to_string(), expr.to_string()))
    }

    fn new_store(&self, params: &StoreParams) -> Result<Arc<dyn Store>, StoreError> {
        let base_url = params.require_str(DOMAIN_NAME, "url")?;
        Ok(Arc::new(PrometheusStore::new(base_url)))
    }
}

// =============================================================================
// Store
// =============================================================================

/// HTTP store against a Prometheus-compatible endpoint.
pub struct PrometheusStore {
    base_url: String,
    client: Client,
}

impl PrometheusStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct PromResponse {
    status: String,
    #[serde(default)]
    data: Option<PromData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct PromData {
    #[serde(default)]
    result: Vec<serde_json::Value>,
}

#[async_trait]
impl Store for PrometheusStore {
    fn domain_name(&self) -> &str {
        DOMAIN_NAME
    }

    async fn get(
        &self,
        query: &Query,
        constraint: &Constraint,
        out: &mut dyn Appender,
    ) -> Result<(), StoreError> {
        if query.class().domain_name() != DOMAIN_NAME {
            return Err(StoreError::ClassMismatch {
                domain: DOMAIN_NAME.to_string(),
                class: query.class().full_name(),
            });
        }

        let url = format!("{}/api/v1/query", self.base_url);
        let mut request = self.client.get(&url).query(&[("query", query.selector())]);
        if let Some(end) = constraint.end {
            request = request.query(&[("time", end.timestamp().to_string())]);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() && status.as_u16() != 400 && status.as_u16() != 422 {
            return Err(StoreError::Unavailable(format!(
                "metric store returned {status}"
            )));
        }

        let parsed: PromResponse = response.json().await.map_err(|e| StoreError::BadQuery {
            query: query.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.status != "success" {
            return Err(StoreError::BadQuery {
                query: query.to_string(),
                reason: parsed.error.unwrap_or_else(|| "query failed".to_string()),
            });
        }

        for sample in parsed.data.map(|d| d.result).unwrap_or_default() {
            if !out.append(Object::new(sample)) {
                break;
            }
        }
        Ok(())
    }
}
