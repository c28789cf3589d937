//! The store contract: the engine's only I/O boundary.
//!
//! A [`Store`] resolves a [`Query`] against a backend and pushes each
//! returned object into an [`Appender`]. Stores hold connection state
//! (endpoint, auth) but are stateless per call; concurrent `get` calls on
//! one store must be safe.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{DEFAULT_RETRY_BASE_MS, DEFAULT_RETRY_CAP_MS, DEFAULT_STORE_RETRIES};
use crate::constraint::Constraint;
use crate::domain::{Object, Query};

/// Errors a store can report.
///
/// Only [`StoreError::Unavailable`] is retried; everything else is final.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Transient I/O failure: connection refused, 5xx, timeout.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store could not parse or execute the query.
    #[error("bad query {query:?}: {reason}")]
    BadQuery { query: String, reason: String },

    /// The query's class does not belong to this store's domain.
    #[error("query class {class:?} does not belong to domain {domain:?}")]
    ClassMismatch { domain: String, class: String },

    /// The store's connection parameters are malformed.
    #[error("invalid store parameters for domain {domain:?}: {reason}")]
    BadParams { domain: String, reason: String },
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Receives objects from a store. `append` returns false once the receiver
/// is at capacity; the store should stop producing.
pub trait Appender: Send {
    fn append(&mut self, obj: Object) -> bool;
}

impl Appender for Vec<Object> {
    fn append(&mut self, obj: Object) -> bool {
        self.push(obj);
        true
    }
}

/// An appender that accepts at most `cap` objects.
pub struct CappedAppender {
    objects: Vec<Object>,
    cap: usize,
}

impl CappedAppender {
    pub fn new(cap: usize) -> Self {
        Self {
            objects: Vec::new(),
            cap,
        }
    }

    pub fn into_objects(self) -> Vec<Object> {
        self.objects
    }
}

impl Appender for CappedAppender {
    fn append(&mut self, obj: Object) -> bool {
        if self.objects.len() >= self.cap {
            return false;
        }
        self.objects.push(obj);
        self.objects.len() < self.cap
    }
}

/// Executes queries against one backend.
#[async_trait]
pub trait Store: Send + Sync {
    /// Name of the domain this store serves.
    fn domain_name(&self) -> &str;

    /// Resolve `query`, pushing each object into `out`.
    ///
    /// The store applies the constraint's time window where the backend
    /// supports pushdown; count limits are enforced by the caller through
    /// the appender.
    async fn get(
        &self,
        query: &Query,
        constraint: &Constraint,
        out: &mut dyn Appender,
    ) -> Result<(), StoreError>;
}

/// Opaque backend-specific connection parameters, taken from the `stores`
/// section of the configuration document.
#[derive(Debug, Clone, Default)]
pub struct StoreParams(serde_json::Value);

impl StoreParams {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// A required string parameter.
    pub fn require_str(&self, domain: &str, key: &str) -> Result<String, StoreError> {
        self.get_str(key).ok_or_else(|| StoreError::BadParams {
            domain: domain.to_string(),
            reason: format!("missing required key {key:?}"),
        })
    }

    /// An optional string parameter.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.0.get(key)?.as_str().map(str::to_string)
    }

    /// An optional boolean parameter.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key)?.as_bool()
    }

    /// An optional sub-document.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }
}

// =============================================================================
// Retry
// =============================================================================

/// Retry policy for transient store failures: exponential backoff,
/// doubling from `base` up to `cap`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_STORE_RETRIES,
            base: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            cap: Duration::from_millis(DEFAULT_RETRY_CAP_MS),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Calls `store.get`, retrying [`StoreError::Unavailable`] per `policy`.
///
/// Results from failed attempts are discarded; only the successful
/// attempt's objects end up in `out`.
pub async fn get_with_retry(
    store: &dyn Store,
    query: &Query,
    constraint: &Constraint,
    policy: &RetryPolicy,
    out: &mut Vec<Object>,
) -> Result<(), StoreError> {
    let mut attempt = 0u32;
    loop {
        let mut buffer = Vec::new();
        match store.get(query, constraint, &mut buffer).await {
            Ok(()) => {
                out.append(&mut buffer);
                return Ok(());
            }
            Err(StoreError::Unavailable(reason)) if attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay(attempt);
                tracing::debug!(
                    query = %query,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    %reason,
                    "store unavailable, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles_to_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_millis(2000));
    }

    #[test]
    fn test_capped_appender_rejects_overflow() {
        let mut appender = CappedAppender::new(2);
        assert!(appender.append(Object::new(serde_json::json!(1))));
        assert!(!appender.append(Object::new(serde_json::json!(2))));
        assert!(!appender.append(Object::new(serde_json::json!(3))));
        assert_eq!(appender.into_objects().len(), 2);
    }
}
