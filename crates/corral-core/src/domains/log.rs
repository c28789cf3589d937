//! Log domain: log streams addressed by stream selectors.
//!
//! Three classes mirror the usual collector split: `application`,
//! `infrastructure`, `audit`. Queries are stream selectors in the LogQL
//! style, optionally prefixed with the class:
//!
//! ```text
//! {namespace="ns1",pod="p1"}
//! audit:{user="admin"}
//! ```
//!
//! A bare selector defaults to `application`. The canonical form sorts
//! matchers by label name. The store queries a Loki-compatible
//! `query_range` endpoint and pushes the constraint's time window down.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::constraint::Constraint;
use crate::domain::{Domain, Id, Object, Query, QueryParseError};
use crate::store::{Appender, Store, StoreError, StoreParams};

pub const DOMAIN_NAME: &str = "log";

const CLASSES: &[&str] = &["application", "infrastructure", "audit"];

/// Default result cap when no constraint limit applies.
const DEFAULT_QUERY_LIMIT: usize = 100;

/// The log domain.
pub struct LogDomain;

impl LogDomain {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LogDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl Domain for LogDomain {
    fn name(&self) -> &str {
        DOMAIN_NAME
    }

    fn class_names(&self) -> Vec<String> {
        CLASSES.iter().map(|c| c.to_string()).collect()
    }

    fn object_id(&self, _class: &str, obj: &Object) -> Id {
        let mut hasher = Sha256::new();
        if let Some(labels) = obj.field("labels").and_then(|v| v.as_object()) {
            // serde_json maps are key-sorted, so this is stable.
            for (k, v) in labels {
                hasher.update(k.as_bytes());
                hasher.update(b"=");
                hasher.update(v.to_string().as_bytes());
                hasher.update(b",");
            }
        }
        if let Some(ts) = obj.field("timestamp").and_then(|v| v.as_str()) {
            hasher.update(ts.as_bytes());
        }
        if let Some(body) = obj.field("body").and_then(|v| v.as_str()) {
            hasher.update(body.as_bytes());
        }
        Id::new(format!("{:x}", hasher.finalize()))
    }

    fn parse_selector(&self, s: &str) -> Result<(String, String), QueryParseError> {
        let (class, selector) = match s.split_once(':') {
            Some((class, rest)) if CLASSES.contains(&class) => (class.to_string(), rest),
            _ => ("application".to_string(), s),
        };
        let canonical =
            canonicalize_selector(selector).map_err(|reason| QueryParseError::Malformed {
                domain: DOMAIN_NAME.to_string(),
                query: s.to_string(),
                reason,
            })?;
        Ok((class, canonical))
    }

    fn new_store(&self, params: &StoreParams) -> Result<Arc<dyn Store>, StoreError> {
        let base_url = params.require_str(DOMAIN_NAME, "url")?;
        Ok(Arc::new(LokiStore::new(base_url)))
    }
}

/// One `label op "value"` term.
struct Matcher {
    label: String,
    op: &'static str,
    value: String,
}

/// Parses a `{...}` stream selector and re-emits it with matchers sorted
/// by label name.
fn canonicalize_selector(s: &str) -> Result<String, String> {
    let s = s.trim();
    let inner = s
        .strip_prefix('{')
        .and_then(|rest| rest.strip_suffix('}'))
        .ok_or_else(|| "selector must be {label=\"value\",...}".to_string())?;

    let mut matchers = parse_matchers(inner)?;
    matchers.sort_by(|a, b| a.label.cmp(&b.label));

    let terms: Vec<String> = matchers
        .iter()
        .map(|m| format!("{}{}\"{}\"", m.label, m.op, m.value))
        .collect();
    Ok(format!("{{{}}}", terms.join(",")))
}

fn parse_matchers(inner: &str) -> Result<Vec<Matcher>, String> {
    let mut matchers = Vec::new();
    let mut chars = inner.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut label = String::new();
        while matches!(chars.peek(), Some(c) if c.is_alphanumeric() || *c == '_') {
            if let Some(c) = chars.next() {
                label.push(c);
            }
        }
        if label.is_empty() {
            return Err("expected label name".to_string());
        }

        let op = match chars.next() {
            Some('=') => {
                if chars.peek() == Some(&'~') {
                    chars.next();
                    "=~"
                } else {
                    "="
                }
            }
            Some('!') => match chars.next() {
                Some('=') => "!=",
                Some('~') => "!~",
                _ => return Err(format!("bad operator after label {label:?}")),
            },
            _ => return Err(format!("expected operator after label {label:?}")),
        };

        if chars.next() != Some('"') {
            return Err(format!("expected quoted value for label {label:?}"));
        }
        let mut value = String::new();
        loop {
            match chars.next() {
                Some('\\') => {
                    if let Some(escaped) = chars.next() {
                        value.push('\\');
                        value.push(escaped);
                    }
                }
                Some('"') => break,
                Some(c) => value.push(c),
                None => return Err(format!("unterminated value for label {label:?}")),
            }
        }

        matchers.push(Matcher { label, op, value });
    }
    Ok(matchers)
}

// =============================================================================
// Store
// =============================================================================

/// HTTP store against a Loki-compatible endpoint.
pub struct LokiStore {
    base_url: String,
    client: Client,
}

impl LokiStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct LokiResponse {
    data: LokiData,
}

#[derive(Deserialize)]
struct LokiData {
    #[serde(default)]
    result: Vec<LokiStream>,
}

#[derive(Deserialize)]
struct LokiStream {
    #[serde(default)]
    stream: serde_json::Map<String, serde_json::Value>,
    /// Pairs of (timestamp in nanoseconds, line).
    #[serde(default)]
    values: Vec<(String, String)>,
}

#[async_trait]
impl Store for LokiStore {
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

        let url = format!("{}/loki/api/v1/query_range", self.base_url);
        let limit = constraint
            .limit_per_step
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .to_string();
        let mut request = self
            .client
            .get(&url)
            .query(&[("query", query.selector()), ("limit", limit.as_str())]);
        if let Some(start) = constraint.start {
            request = request.query(&[(
                "start",
                (start.timestamp_nanos_opt().unwrap_or(0)).to_string(),
            )]);
        }
        if let Some(end) = constraint.end {
            request = request.query(&[(
                "end",
                (end.timestamp_nanos_opt().unwrap_or(i64::MAX)).to_string(),
            )]);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 400 {
            return Err(StoreError::BadQuery {
                query: query.to_string(),
                reason: format!("log store returned {status}"),
            });
        }
        if !status.is_success() {
            return Err(StoreError::Unavailable(format!(
                "log store returned {status}"
            )));
        }

        let parsed: LokiResponse = response.json().await.map_err(|e| StoreError::BadQuery {
            query: query.to_string(),
            reason: e.to_string(),
        })?;

        'streams: for stream in parsed.data.result {
            for (timestamp, body) in stream.values {
                let obj = Object::new(serde_json::json!({
                    "labels": stream.stream,
                    "timestamp": timestamp,
                    "body": body,
                }));
                if !out.append(obj) {
                    break 'streams;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain() -> LogDomain {
        LogDomain::new()
    }

    #[test]
    fn test_bare_selector_defaults_to_application() {
        let (class, selector) = domain()
            .parse_selector(r#"{namespace="ns1",pod="p1"}"#)
            .unwrap();
        assert_eq!(class, "application");
        assert_eq!(selector, r#"{namespace="ns1",pod="p1"}"#);
    }

    #[test]
    fn test_class_prefix_and_sorting() {
        let (class, selector) = domain()
            .parse_selector(r#"audit:{user="admin",verb="delete"}"#)
            .unwrap();
        assert_eq!(class, "audit");
        assert_eq!(selector, r#"{user="admin",verb="delete"}"#);

        let (_, sorted) = domain()
            .parse_selector(r#"{pod="p1",namespace="ns1"}"#)
            .unwrap();
        assert_eq!(sorted, r#"{namespace="ns1",pod="p1"}"#);
    }

    #[test]
    fn test_regex_operators_preserved() {
        let (_, selector) = domain().parse_selector(r#"{pod=~"web-.*"}"#).unwrap();
        assert_eq!(selector, r#"{pod=~"web-.*"}"#);
    }

    #[test]
    fn test_malformed_selector_rejected() {
        assert!(domain().parse_selector("no-braces").is_err());
        assert!(domain().parse_selector(r#"{pod}"#).is_err());
        assert!(domain().parse_selector(r#"{pod="unterminated}"#).is_err());
    }

    #[test]
    fn test_log_id_depends_on_content() {
        let d = domain();
        let a = Object::new(serde_json::json!({
            "labels": {"pod": "p1"}, "timestamp": "1", "body": "hello"
        }));
        let b = Object::new(serde_json::json!({
            "labels": {"pod": "p1"}, "timestamp": "1", "body": "world"
        }));
        assert_ne!(d.object_id("application", &a), d.object_id("application", &b));
        assert_eq!(d.object_id("application", &a), d.object_id("application", &a));
    }
}
