//! Declarative configuration: stores, rules, aliases, includes.
//!
//! A configuration document is YAML (JSON is accepted too) with four
//! recognized top-level keys; anything else is rejected:
//!
//! ```yaml
//! include: [base.yaml]            # merged depth-first, later wins by rule name
//! aliases:
//!   - name: workloads
//!     domain: k8s
//!     classes: [Deployment, ReplicaSet, StatefulSet]
//! stores:
//!   - domain: k8s
//!     url: https://api.cluster.example:6443
//! rules:
//!   - name: PodToLogs
//!     start: {domain: k8s, classes: [Pod]}
//!     goal:  {domain: log, classes: [application]}
//!     result: {query: '...'}
//! ```
//!
//! Validation is strict at load time: unknown keys, unknown domains or
//! classes, duplicate rule names, empty class sets, undefined aliases, and
//! template compile errors are all fatal, reported with the offending
//! rule/store/alias name.

mod defaults;

pub use defaults::*;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Class;
use crate::engine::Engine;
use crate::rule::{Rule, RuleError};
use crate::store::{StoreError, StoreParams};

/// Configuration errors. All are fatal at load or apply time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("include cycle through {0}")]
    IncludeCycle(PathBuf),

    #[error("{context}: unknown domain {domain:?}")]
    UnknownDomain { context: String, domain: String },

    #[error("{context}: unknown class {class:?} in domain {domain:?}")]
    UnknownClass {
        context: String,
        domain: String,
        class: String,
    },

    #[error("{context}: undefined alias {alias:?}")]
    UnknownAlias { context: String, alias: String },

    #[error("duplicate rule name {0:?}")]
    DuplicateRule(String),

    #[error("duplicate alias name {0:?}")]
    DuplicateAlias(String),

    #[error("{context}: empty class list")]
    EmptyClasses { context: String },

    #[error("rule {name:?}: {source}")]
    Rule {
        name: String,
        #[source]
        source: RuleError,
    },

    #[error("store for domain {domain:?}: {source}")]
    Store {
        domain: String,
        #[source]
        source: StoreError,
    },
}

/// A parsed configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Paths to merge in before this document's own entries.
    pub include: Vec<String>,

    /// Named class groups, usable wherever a class list is expected.
    pub aliases: Vec<AliasConfig>,

    /// Store connection entries, one per domain.
    pub stores: Vec<StoreConfig>,

    /// Correlation rules.
    pub rules: Vec<RuleConfig>,
}

/// A named class group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AliasConfig {
    pub name: String,
    pub domain: String,
    pub classes: Vec<String>,
}

/// One store entry: a domain name plus backend-specific keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub domain: String,
    #[serde(flatten)]
    pub params: serde_yaml::Mapping,
}

/// One rule entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub name: String,
    pub start: ClassListConfig,
    pub goal: ClassListConfig,
    pub result: ResultConfig,
}

/// A class list scoped to one domain. Entries may be class names or alias
/// names defined in the same document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassListConfig {
    pub domain: String,
    pub classes: Vec<String>,
}

/// The query template a rule expands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultConfig {
    pub query: String,
}

impl Config {
    /// Loads a configuration file, resolving includes depth-first
    /// relative to each including file. Later entries override earlier
    /// rules with the same name. A file included more than once is merged
    /// only the first time; include cycles are fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut stack = Vec::new();
        let mut done = HashSet::new();
        Self::load_recursive(path.as_ref(), &mut stack, &mut done)
    }

    /// Parses a configuration document from a string (no includes).
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    fn load_recursive(
        path: &Path,
        stack: &mut Vec<PathBuf>,
        done: &mut HashSet<PathBuf>,
    ) -> Result<Self, ConfigError> {
        let canonical = path.canonicalize().map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if stack.contains(&canonical) {
            return Err(ConfigError::IncludeCycle(canonical));
        }
        if !done.insert(canonical.clone()) {
            return Ok(Config::default());
        }
        stack.push(canonical);

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let own: Config = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut merged = Config::default();
        for include in &own.include {
            let include_path = base_dir.join(include);
            let included = Self::load_recursive(&include_path, stack, done)?;
            merged.merge(included);
        }
        merged.merge(Config {
            include: Vec::new(),
            ..own
        });
        stack.pop();
        Ok(merged)
    }

    /// Merges `other` into `self`: aliases and stores append; rules with a
    /// known name replace in place, new names append.
    fn merge(&mut self, other: Config) {
        self.aliases.extend(other.aliases);
        self.stores.extend(other.stores);
        for rule in other.rules {
            match self.rules.iter_mut().find(|r| r.name == rule.name) {
                Some(existing) => *existing = rule,
                None => self.rules.push(rule),
            }
        }
    }

    /// Validates the document against the engine's domains and installs
    /// stores and rules.
    pub fn apply(&self, engine: &mut Engine) -> Result<(), ConfigError> {
        let aliases = self.resolve_aliases(engine)?;

        for store in &self.stores {
            let context = format!("store for domain {:?}", store.domain);
            engine
                .registry()
                .domain(&store.domain)
                .map_err(|_| ConfigError::UnknownDomain {
                    context,
                    domain: store.domain.clone(),
                })?;
            let params = params_from_mapping(&store.params);
            engine
                .add_store(&store.domain, &params)
                .map_err(|err| match err {
                    crate::engine::EngineError::Store(source) => ConfigError::Store {
                        domain: store.domain.clone(),
                        source,
                    },
                    other => ConfigError::Store {
                        domain: store.domain.clone(),
                        source: StoreError::BadParams {
                            domain: store.domain.clone(),
                            reason: other.to_string(),
                        },
                    },
                })?;
        }

        let mut seen_rules = HashSet::new();
        for rule_config in &self.rules {
            if !seen_rules.insert(rule_config.name.clone()) {
                return Err(ConfigError::DuplicateRule(rule_config.name.clone()));
            }
            let context = format!("rule {:?}", rule_config.name);
            let start = self.resolve_classes(engine, &aliases, &rule_config.start, &context)?;
            let goal = self.resolve_classes(engine, &aliases, &rule_config.goal, &context)?;

            let rule = Rule::new(
                rule_config.name.clone(),
                start,
                goal,
                &rule_config.result.query,
            )
            .map_err(|source| ConfigError::Rule {
                name: rule_config.name.clone(),
                source,
            })?;
            engine.add_rule(rule).map_err(|_| {
                ConfigError::DuplicateRule(rule_config.name.clone())
            })?;
        }
        Ok(())
    }

    /// Resolves alias definitions in document order. An alias may expand
    /// aliases defined before it; forward references are fatal.
    fn resolve_aliases(
        &self,
        engine: &Engine,
    ) -> Result<HashMap<(String, String), Vec<Class>>, ConfigError> {
        let mut resolved: HashMap<(String, String), Vec<Class>> = HashMap::new();
        for alias in &self.aliases {
            let context = format!("alias {:?}", alias.name);
            let key = (alias.domain.clone(), alias.name.clone());
            if resolved.contains_key(&key) {
                return Err(ConfigError::DuplicateAlias(alias.name.clone()));
            }
            if alias.classes.is_empty() {
                return Err(ConfigError::EmptyClasses { context });
            }
            let mut classes = Vec::new();
            for name in &alias.classes {
                self.expand_class(engine, &resolved, &alias.domain, name, &context, &mut classes)?;
            }
            resolved.insert(key, classes);
        }
        Ok(resolved)
    }

    fn resolve_classes(
        &self,
        engine: &Engine,
        aliases: &HashMap<(String, String), Vec<Class>>,
        list: &ClassListConfig,
        context: &str,
    ) -> Result<Vec<Class>, ConfigError> {
        if list.classes.is_empty() {
            return Err(ConfigError::EmptyClasses {
                context: context.to_string(),
            });
        }
        let mut classes = Vec::new();
        for name in &list.classes {
            self.expand_class(engine, aliases, &list.domain, name, context, &mut classes)?;
        }
        Ok(classes)
    }

    /// Expands one class-list entry: an alias reference or a class name.
    fn expand_class(
        &self,
        engine: &Engine,
        aliases: &HashMap<(String, String), Vec<Class>>,
        domain_name: &str,
        name: &str,
        context: &str,
        out: &mut Vec<Class>,
    ) -> Result<(), ConfigError> {
        if let Some(group) = aliases.get(&(domain_name.to_string(), name.to_string())) {
            for class in group {
                if !out.contains(class) {
                    out.push(class.clone());
                }
            }
            return Ok(());
        }

        let domain = engine.registry().domain(domain_name).map_err(|_| {
            ConfigError::UnknownDomain {
                context: context.to_string(),
                domain: domain_name.to_string(),
            }
        })?;
        if !domain.has_class(name) {
            // Not a class; if it was meant as an alias, say so.
            if self.aliases.iter().any(|a| a.name == name) {
                return Err(ConfigError::UnknownAlias {
                    context: context.to_string(),
                    alias: name.to_string(),
                });
            }
            return Err(ConfigError::UnknownClass {
                context: context.to_string(),
                domain: domain_name.to_string(),
                class: name.to_string(),
            });
        }
        let class = Class::new(std::sync::Arc::clone(domain), name);
        if !out.contains(&class) {
            out.push(class);
        }
        Ok(())
    }
}

/// Converts a YAML store mapping (minus the `domain` key) into opaque
/// store parameters.
fn params_from_mapping(mapping: &serde_yaml::Mapping) -> StoreParams {
    let value = serde_json::to_value(mapping).unwrap_or(serde_json::Value::Null);
    StoreParams::new(value)
}
