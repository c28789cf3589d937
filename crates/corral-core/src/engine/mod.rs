//! The correlation engine.
//!
//! An [`Engine`] owns the domain registry, the configured stores, and the
//! rule set, and runs traversals:
//!
//! - [`Engine::neighbours`] - everything reachable within a depth bound
//! - [`Engine::goals`] - objects of specific goal classes, via rule chains
//!
//! Engine state is read-only during traversal, so concurrent traversals on
//! one engine are safe. There is no global state: domains, stores and rules
//! are explicit to the instance.

mod cancel;
mod follower;

pub use cancel::CancelToken;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::{DEFAULT_MAX_CHAIN_DEPTH, DEFAULT_QUERY_TIMEOUT_SECS, DEFAULT_WORKER_POOL};
use crate::constraint::Constraint;
use crate::domain::{Class, Domain, Object, Query, QueryParseError, Registry, RegistryError};
use crate::graph::Graph;
use crate::rule::{Rule, RuleIndex, RuleRef};
use crate::store::{get_with_retry, RetryPolicy, Store, StoreError, StoreParams};

/// Fatal engine errors. Everything recoverable is recorded on the graph
/// instead (see `Graph::errors`).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    QueryParse(#[from] QueryParseError),

    #[error("duplicate rule name {0:?}")]
    DuplicateRule(String),

    #[error("no store configured for domain {0:?}")]
    StoreMissing(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tunable engine options.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Concurrent query resolutions per traversal level.
    pub worker_pool: usize,

    /// Per-query timeout.
    pub query_timeout: Duration,

    /// Maximum rule-chain length explored by [`Engine::goals`].
    pub max_chain_depth: usize,

    /// Retry policy for transient store failures.
    pub retry: RetryPolicy,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            worker_pool: DEFAULT_WORKER_POOL,
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
            max_chain_depth: DEFAULT_MAX_CHAIN_DEPTH,
            retry: RetryPolicy::default(),
        }
    }
}

/// The correlation engine.
pub struct Engine {
    registry: Registry,
    stores: HashMap<String, Arc<dyn Store>>,
    rules: Vec<RuleRef>,
    index: RuleIndex,
    options: EngineOptions,
}

impl Engine {
    /// Creates an engine over the given domains with default options.
    pub fn new(domains: Vec<Arc<dyn Domain>>) -> Result<Self, EngineError> {
        Self::with_options(domains, EngineOptions::default())
    }

    /// Creates an engine with explicit options.
    pub fn with_options(
        domains: Vec<Arc<dyn Domain>>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            registry: Registry::new(domains)?,
            stores: HashMap::new(),
            rules: Vec::new(),
            index: RuleIndex::new(&[]),
            options,
        })
    }

    /// The engine's domain registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Engine options.
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Resolves a `domain:class` name.
    pub fn class(&self, full_name: &str) -> Result<Class, EngineError> {
        Ok(self.registry.class(full_name)?)
    }

    /// Parses a `domain:...` query string.
    pub fn query(&self, s: &str) -> Result<Query, EngineError> {
        Ok(self.registry.query(s)?)
    }

    /// Creates and installs a store for `domain` from backend parameters.
    pub fn add_store(&mut self, domain: &str, params: &StoreParams) -> Result<(), EngineError> {
        let domain = Arc::clone(self.registry.domain(domain)?);
        let store = domain.new_store(params)?;
        self.stores.insert(domain.name().to_string(), store);
        Ok(())
    }

    /// Installs an already-built store. Replaces any previous store for
    /// the same domain.
    pub fn add_store_instance(&mut self, store: Arc<dyn Store>) {
        self.stores.insert(store.domain_name().to_string(), store);
    }

    /// The store configured for a domain, if any.
    pub fn store(&self, domain: &str) -> Option<&Arc<dyn Store>> {
        self.stores.get(domain)
    }

    /// Adds a correlation rule. Rule names must be unique.
    pub fn add_rule(&mut self, rule: Rule) -> Result<(), EngineError> {
        if self.rules.iter().any(|r| r.name() == rule.name()) {
            return Err(EngineError::DuplicateRule(rule.name().to_string()));
        }
        self.rules.push(Arc::new(rule));
        self.index = RuleIndex::new(&self.rules);
        Ok(())
    }

    /// Adds several rules.
    pub fn add_rules(&mut self, rules: impl IntoIterator<Item = Rule>) -> Result<(), EngineError> {
        for rule in rules {
            self.add_rule(rule)?;
        }
        Ok(())
    }

    /// The installed rules, in insertion order.
    pub fn rules(&self) -> &[RuleRef] {
        &self.rules
    }

    pub(crate) fn rule_index(&self) -> &RuleIndex {
        &self.index
    }

    /// Resolves a seed query into objects, through the domain's store.
    pub async fn seed_from_query(
        &self,
        query: &Query,
        constraint: &Constraint,
    ) -> Result<Vec<Object>, EngineError> {
        let domain = query.class().domain_name();
        let store = self
            .stores
            .get(domain)
            .ok_or_else(|| EngineError::StoreMissing(domain.to_string()))?;
        let mut objects = Vec::new();
        get_with_retry(
            store.as_ref(),
            query,
            constraint,
            &self.options.retry,
            &mut objects,
        )
        .await?;
        Ok(objects)
    }

    /// Explores every class reachable from the seeds within `depth` rule
    /// applications, level by level: expand the frontier through every
    /// applicable rule, resolve the queries concurrently, merge new
    /// objects as the next frontier.
    pub async fn neighbours(
        &self,
        seeds: Vec<(Class, Vec<Object>)>,
        depth: usize,
        constraint: &Constraint,
        cancel: &CancelToken,
    ) -> Result<Graph, EngineError> {
        follower::Follower::new(self, constraint.clone(), cancel.clone())
            .neighbours(seeds, depth)
            .await
    }

    /// Finds objects of the goal classes reachable from the seeds via
    /// rule chains of length up to `options.max_chain_depth`.
    pub async fn goals(
        &self,
        seeds: Vec<(Class, Vec<Object>)>,
        goal_classes: &[Class],
        constraint: &Constraint,
        cancel: &CancelToken,
    ) -> Result<Graph, EngineError> {
        follower::Follower::new(self, constraint.clone(), cancel.clone())
            .goals(seeds, goal_classes)
            .await
    }
}
