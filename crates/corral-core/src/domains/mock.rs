//! Mock domain: scripted in-memory stores for tests and demos.
//!
//! The mock domain accepts any class name. Its query form is
//! `Class:selector`; a mock store resolves a query by looking its full
//! string form up in an in-memory table. Stores can be scripted to fail a
//! number of times before succeeding and to respond with artificial
//! latency, which is how transient-failure and cancellation behavior is
//! exercised.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::constraint::Constraint;
use crate::domain::{Domain, Id, Object, Query, QueryParseError};
use crate::store::{Appender, Store, StoreError, StoreParams};

/// A domain with arbitrary classes backed by scripted stores.
pub struct MockDomain {
    name: String,
}

impl MockDomain {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Domain for MockDomain {
    fn name(&self) -> &str {
        &self.name
    }

    fn class_names(&self) -> Vec<String> {
        Vec::new()
    }

    // Any non-empty name is a valid mock class.
    fn has_class(&self, name: &str) -> bool {
        !name.is_empty()
    }

    fn object_id(&self, _class: &str, obj: &Object) -> Id {
        match obj.field("name").and_then(|v| v.as_str()) {
            Some(name) => Id::new(name),
            None => Id::hash_of(obj),
        }
    }

    fn parse_selector(&self, s: &str) -> Result<(String, String), QueryParseError> {
        let (class, selector) = s.split_once(':').ok_or_else(|| QueryParseError::Malformed {
            domain: self.name.clone(),
            query: s.to_string(),
            reason: "expected class:selector".to_string(),
        })?;
        if class.is_empty() {
            return Err(QueryParseError::Malformed {
                domain: self.name.clone(),
                query: s.to_string(),
                reason: "empty class name".to_string(),
            });
        }
        Ok((class.to_string(), selector.to_string()))
    }

    fn new_store(&self, params: &StoreParams) -> Result<Arc<dyn Store>, StoreError> {
        let store = MockStore::new(&self.name);
        // Inline result table: objects: {"<query>": [ ... ]}.
        if let Some(objects) = params.get("objects").and_then(|v| v.as_object()) {
            for (query, values) in objects {
                let list = values
                    .as_array()
                    .map(|a| a.iter().cloned().map(Object::new).collect())
                    .unwrap_or_default();
                store.add(query, list);
            }
        }
        Ok(Arc::new(store))
    }
}

/// Scripted in-memory store.
pub struct MockStore {
    domain: String,
    results: Mutex<HashMap<String, Vec<Object>>>,
    failures: Mutex<HashMap<String, u32>>,
    latency: Mutex<Option<Duration>>,
}

impl MockStore {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            results: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            latency: Mutex::new(None),
        }
    }

    /// Registers the objects returned for a query (full string form,
    /// `domain:class:selector`).
    pub fn add(&self, query: impl Into<String>, objects: Vec<Object>) {
        self.results.lock().unwrap().insert(query.into(), objects);
    }

    /// Makes the next `times` resolutions of `query` fail transiently.
    pub fn fail(&self, query: impl Into<String>, times: u32) {
        self.failures.lock().unwrap().insert(query.into(), times);
    }

    /// Adds artificial latency to every resolution.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }
}

#[async_trait]
impl Store for MockStore {
    fn domain_name(&self) -> &str {
        &self.domain
    }

    async fn get(
        &self,
        query: &Query,
        _constraint: &Constraint,
        out: &mut dyn Appender,
    ) -> Result<(), StoreError> {
        if query.class().domain_name() != self.domain {
            return Err(StoreError::ClassMismatch {
                domain: self.domain.clone(),
                class: query.class().full_name(),
            });
        }

        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let key = query.to_string();
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::Unavailable(format!(
                        "scripted failure for {key}"
                    )));
                }
            }
        }

        let objects = self
            .results
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .unwrap_or_default();
        for obj in objects {
            if !out.append(obj) {
                break;
            }
        }
        Ok(())
    }
}
