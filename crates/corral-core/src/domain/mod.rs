//! The domain/class/object/query model.
//!
//! A [`Domain`] is a namespace of classes sharing one query language and one
//! store type. The engine drives every backend through this abstraction:
//!
//! - [`Class`] - a (domain, local-name) pair identifying a kind of object
//! - [`Object`] - one observation, opaque JSON owned by its domain
//! - [`Query`] - a resolvable descriptor for a set of objects of one class
//!
//! Domains are registered by name in an engine-owned [`Registry`];
//! there is no process-wide registration.

mod registry;

pub use registry::{Registry, RegistryError};

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::store::{Store, StoreError, StoreParams};

/// A backend domain: classes, a query parser, and a store factory.
///
/// Implementations must be cheap to share (`Arc<dyn Domain>`) and must not
/// hold per-call state; the stateful half lives in the [`Store`] they create.
pub trait Domain: Send + Sync {
    /// Globally unique domain name, e.g. `"k8s"`.
    fn name(&self) -> &str;

    /// All class names this domain defines.
    ///
    /// Domains that accept arbitrary class names (the mock domain) may
    /// return an empty list and override [`Domain::has_class`].
    fn class_names(&self) -> Vec<String>;

    /// Whether `name` is a valid class in this domain.
    fn has_class(&self, name: &str) -> bool {
        self.class_names().iter().any(|c| c == name)
    }

    /// Identity of `obj` within `class`, used to coalesce duplicates.
    ///
    /// Must be a deterministic function of the object.
    fn object_id(&self, class: &str, obj: &Object) -> Id;

    /// Parse a domain-native query string into `(class name, canonical selector)`.
    ///
    /// Accepts both the bare native form (e.g. a k8s API path) and the
    /// `class:selector` spelling used by the full `domain:class:selector`
    /// query syntax. The returned selector is canonical: parsing the
    /// canonical form again yields the same pair.
    fn parse_selector(&self, s: &str) -> Result<(String, String), QueryParseError>;

    /// Create a store from backend-specific connection parameters.
    fn new_store(&self, params: &StoreParams) -> Result<Arc<dyn Store>, StoreError>;
}

/// Failure to parse a query string.
#[derive(Debug, Error)]
pub enum QueryParseError {
    #[error("query has no domain prefix: {0:?}")]
    MissingDomain(String),

    #[error("unknown domain {0:?}")]
    UnknownDomain(String),

    #[error("unknown class {class:?} in domain {domain:?}")]
    UnknownClass { domain: String, class: String },

    #[error("malformed {domain} query {query:?}: {reason}")]
    Malformed {
        domain: String,
        query: String,
        reason: String,
    },
}

// =============================================================================
// Class
// =============================================================================

/// A kind of object within a domain.
///
/// Classes are values: two classes are equal iff their domain names and
/// local names match. Cloning is cheap (two `Arc`s).
#[derive(Clone)]
pub struct Class {
    domain: Arc<dyn Domain>,
    name: Arc<str>,
}

impl Class {
    /// Creates a class handle. The caller is responsible for `name` being
    /// valid in `domain`; [`Registry::class`] is the checked entry point.
    pub fn new(domain: Arc<dyn Domain>, name: impl Into<Arc<str>>) -> Self {
        Self {
            domain,
            name: name.into(),
        }
    }

    /// The domain this class belongs to.
    pub fn domain(&self) -> &Arc<dyn Domain> {
        &self.domain
    }

    /// The domain's name.
    pub fn domain_name(&self) -> &str {
        self.domain.name()
    }

    /// The class's local name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `domain:class` spelling.
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.domain.name(), self.name)
    }

    /// Identity of `obj` under this class.
    pub fn id(&self, obj: &Object) -> Id {
        self.domain.object_id(&self.name, obj)
    }

    /// A fresh empty object of this class, for deserializers.
    pub fn new_object(&self) -> Object {
        Object::new(serde_json::Value::Object(serde_json::Map::new()))
    }
}

impl PartialEq for Class {
    fn eq(&self, other: &Self) -> bool {
        self.domain.name() == other.domain.name() && self.name == other.name
    }
}

impl Eq for Class {}

impl Hash for Class {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.domain.name().hash(state);
        self.name.hash(state);
    }
}

impl PartialOrd for Class {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Class {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.domain.name(), self.name.as_ref()).cmp(&(other.domain.name(), other.name.as_ref()))
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Class({})", self.full_name())
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

// =============================================================================
// Object
// =============================================================================

/// One observation from a backend: a pod, a log line, a metric sample.
///
/// Objects are opaque domain-owned values. The engine only touches them
/// through the class identity function and [`Object::field`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Object(serde_json::Value);

impl Object {
    /// Wraps a JSON value as an object.
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Parses an object from a JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        Ok(Self(serde_json::from_str(s)?))
    }

    /// Field access by dotted path, e.g. `"metadata.labels.app"`.
    ///
    /// Returns `None` if any path segment is missing or non-object.
    pub fn field(&self, path: &str) -> Option<&serde_json::Value> {
        let mut current = &self.0;
        for segment in path.split('.') {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// The underlying JSON value.
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Consumes the object, returning its JSON value.
    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

impl From<serde_json::Value> for Object {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

// =============================================================================
// Id
// =============================================================================

/// Comparable identity of an object within its class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Identity fallback: SHA-256 of the object's canonical JSON.
    ///
    /// `serde_json` maps are key-sorted, so this is deterministic.
    pub fn hash_of(obj: &Object) -> Self {
        let canonical = serde_json::to_string(obj.as_value()).unwrap_or_default();
        let digest = Sha256::digest(canonical.as_bytes());
        Self(format!("{:x}", digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Query
// =============================================================================

/// A resolvable descriptor for a set of objects of one class.
///
/// The selector is the canonical domain-specific part, so queries compare
/// and hash by value, and the full string form round-trips:
/// parsing `q.to_string()` yields a query equal to `q`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    class: Class,
    selector: String,
}

impl Query {
    pub fn new(class: Class, selector: impl Into<String>) -> Self {
        Self {
            class,
            selector: selector.into(),
        }
    }

    /// The class of objects this query retrieves.
    pub fn class(&self) -> &Class {
        &self.class
    }

    /// The canonical domain-specific selector.
    pub fn selector(&self) -> &str {
        &self.selector
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.class.domain_name(),
            self.class.name(),
            self.selector
        )
    }
}

/// Parses a query in a known domain, accepting both the native short form
/// and the `class:selector` spelling.
pub fn parse_query(domain: &Arc<dyn Domain>, rest: &str) -> Result<Query, QueryParseError> {
    let (class_name, selector) = domain.parse_selector(rest)?;
    if !domain.has_class(&class_name) {
        return Err(QueryParseError::UnknownClass {
            domain: domain.name().to_string(),
            class: class_name,
        });
    }
    let class = Class::new(Arc::clone(domain), class_name);
    Ok(Query::new(class, selector))
}
