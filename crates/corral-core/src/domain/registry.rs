//! Domain registry: name to `Arc<dyn Domain>` resolution.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use super::{parse_query, Class, Domain, Query, QueryParseError};

/// Registry of domains, owned by one engine instance.
///
/// Registration order is preserved for deterministic enumeration.
pub struct Registry {
    domains: HashMap<String, Arc<dyn Domain>>,
    order: Vec<String>,
}

/// Errors raised while registering or resolving domains.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate domain name {0:?}")]
    DuplicateDomain(String),

    #[error("unknown domain {0:?}")]
    UnknownDomain(String),

    #[error("unknown class {0:?}")]
    UnknownClass(String),

    #[error("class name {0:?} is not of the form domain:class")]
    BadClassName(String),
}

impl Registry {
    /// Builds a registry from the given domains. Names must be unique.
    pub fn new(domains: Vec<Arc<dyn Domain>>) -> Result<Self, RegistryError> {
        let mut registry = Self {
            domains: HashMap::new(),
            order: Vec::new(),
        };
        for domain in domains {
            registry.register(domain)?;
        }
        Ok(registry)
    }

    /// Registers one domain.
    pub fn register(&mut self, domain: Arc<dyn Domain>) -> Result<(), RegistryError> {
        let name = domain.name().to_string();
        if self.domains.contains_key(&name) {
            return Err(RegistryError::DuplicateDomain(name));
        }
        self.order.push(name.clone());
        self.domains.insert(name, domain);
        Ok(())
    }

    /// Looks up a domain by name.
    pub fn domain(&self, name: &str) -> Result<&Arc<dyn Domain>, RegistryError> {
        self.domains
            .get(name)
            .ok_or_else(|| RegistryError::UnknownDomain(name.to_string()))
    }

    /// All registered domains in registration order.
    pub fn domains(&self) -> impl Iterator<Item = &Arc<dyn Domain>> {
        self.order.iter().filter_map(|name| self.domains.get(name))
    }

    /// Resolves a `domain:class` name to a class.
    pub fn class(&self, full_name: &str) -> Result<Class, RegistryError> {
        let (domain_name, class_name) = full_name
            .split_once(':')
            .ok_or_else(|| RegistryError::BadClassName(full_name.to_string()))?;
        let domain = self.domain(domain_name)?;
        if !domain.has_class(class_name) {
            return Err(RegistryError::UnknownClass(full_name.to_string()));
        }
        Ok(Class::new(Arc::clone(domain), class_name))
    }

    /// Parses a `domain:...` query string through the domain's parser.
    pub fn query(&self, s: &str) -> Result<Query, QueryParseError> {
        let (domain_name, rest) = s
            .split_once(':')
            .ok_or_else(|| QueryParseError::MissingDomain(s.to_string()))?;
        let domain = self
            .domains
            .get(domain_name)
            .ok_or_else(|| QueryParseError::UnknownDomain(domain_name.to_string()))?;
        parse_query(domain, rest)
    }
}
