//! # corral-core
//!
//! A signal-correlation engine for observability data. Given a set of seed
//! observations (pods, alerts, log lines, metric samples), the engine finds
//! related observations of other kinds by traversing user-declared
//! correlation rules, each of which turns an object of one class into a
//! query for objects of another class.
//!
//! # Components
//!
//! - [`domain`] - the polymorphic domain/class/object/query model
//! - [`store`] - the async I/O boundary to backends, with retry
//! - [`rule`] - template-based query synthesis and the rule index
//! - [`graph`] - the per-traversal result accumulator
//! - [`engine`] - bounded, deduplicated, parallel traversal
//! - [`config`] - the declarative stores/rules/aliases document
//! - [`domains`] - built-in plugins: k8s, log, metric, alert, mock
//!
//! # Example
//!
//! ```ignore
//! use corral_core::{domains, CancelToken, Constraint, Engine};
//!
//! let mut engine = Engine::new(domains::all())?;
//! corral_core::Config::load("corral.yaml")?.apply(&mut engine)?;
//!
//! let pod = engine.class("k8s:Pod")?;
//! let graph = engine
//!     .neighbours(vec![(pod, seeds)], 3, &Constraint::default(), &CancelToken::new())
//!     .await?;
//! ```

pub mod config;
pub mod constraint;
pub mod domain;
pub mod domains;
pub mod engine;
pub mod graph;
pub mod rule;
pub mod store;

pub use config::{Config, ConfigError};
pub use constraint::Constraint;
pub use domain::{Class, Domain, Id, Object, Query, QueryParseError, Registry};
pub use engine::{CancelToken, Engine, EngineError, EngineOptions};
pub use graph::{Edge, FailureKind, Graph, GraphSnapshot, GraphStatus, Node, RuleFailure};
pub use rule::{Rule, RuleError, RuleIndex};
pub use store::{Appender, RetryPolicy, Store, StoreError, StoreParams};
