//! Correlation rules: declarative edges between classes.
//!
//! A rule maps an object of one of its *start* classes to a query whose
//! class is one of its *goal* classes, by rendering a template over the
//! object. Rule application is pure: the same object always yields the
//! same query.

mod index;
mod template;

pub use index::RuleIndex;
pub use template::{Template, TemplateError};

use std::sync::Arc;

use thiserror::Error;

use crate::domain::{parse_query, Class, Object, Query, QueryParseError};

/// Errors from rule construction or application.
///
/// Construction errors reject the rule at load time. Application errors are
/// recorded on the traversal graph and do not abort traversal.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("rule {0:?} has an empty start class set")]
    EmptyStart(String),

    #[error("rule {0:?} has an empty goal class set")]
    EmptyGoal(String),

    #[error("rule {rule:?} goal classes span domains {first:?} and {second:?}")]
    MixedGoalDomains {
        rule: String,
        first: String,
        second: String,
    },

    #[error("rule {rule:?}: {source}")]
    Template {
        rule: String,
        #[source]
        source: TemplateError,
    },

    #[error("rule {rule:?} produced an unparseable query: {source}")]
    QueryInvalid {
        rule: String,
        #[source]
        source: QueryParseError,
    },

    #[error("rule {rule:?} produced query {query:?} outside its goal classes")]
    GoalMismatch { rule: String, query: String },
}

/// A declarative correlation edge.
pub struct Rule {
    name: String,
    start: Vec<Class>,
    goal: Vec<Class>,
    template: Template,
}

impl Rule {
    /// Builds a rule, compiling its template.
    ///
    /// Start and goal sets must be non-empty and all goal classes must
    /// belong to one domain (the template output is parsed by that
    /// domain's query parser). Self-loops are permitted but warned about;
    /// value-level deduplication keeps them from looping at traversal time.
    pub fn new(
        name: impl Into<String>,
        start: Vec<Class>,
        goal: Vec<Class>,
        template_source: &str,
    ) -> Result<Self, RuleError> {
        let name = name.into();
        if start.is_empty() {
            return Err(RuleError::EmptyStart(name));
        }
        if goal.is_empty() {
            return Err(RuleError::EmptyGoal(name));
        }
        let goal_domain = goal[0].domain_name().to_string();
        if let Some(other) = goal.iter().find(|c| c.domain_name() != goal_domain) {
            return Err(RuleError::MixedGoalDomains {
                rule: name,
                first: goal_domain,
                second: other.domain_name().to_string(),
            });
        }

        if start.iter().any(|s| goal.contains(s)) {
            tracing::warn!(rule = %name, "rule goal set contains a start class (self-loop)");
        }

        let template = Template::new(name.clone(), template_source)
            .map_err(|source| RuleError::Template {
                rule: name.clone(),
                source,
            })?;

        Ok(Self {
            name,
            start,
            goal,
            template,
        })
    }

    /// The rule's stable human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Classes this rule applies from.
    pub fn start(&self) -> &[Class] {
        &self.start
    }

    /// Classes this rule leads to.
    pub fn goal(&self) -> &[Class] {
        &self.goal
    }

    /// The template source text.
    pub fn template_source(&self) -> &str {
        self.template.source()
    }

    /// Whether this rule applies to objects of `class`.
    pub fn applies_to(&self, class: &Class) -> bool {
        self.start.contains(class)
    }

    /// Applies the rule to one object of `class`.
    ///
    /// Returns `Ok(None)` when the rule does not apply to `class` or when
    /// the template guards out (renders empty). Template render failures,
    /// unparseable output, and out-of-goal queries are errors scoped to
    /// this (rule, object) pair.
    pub fn apply(&self, class: &Class, obj: &Object) -> Result<Option<Query>, RuleError> {
        if !self.applies_to(class) {
            return Ok(None);
        }

        let rendered = self
            .template
            .render(obj)
            .map_err(|source| RuleError::Template {
                rule: self.name.clone(),
                source,
            })?;
        let rendered = rendered.trim();
        if rendered.is_empty() {
            return Ok(None);
        }

        // Templates may spell the goal domain explicitly; strip it before
        // handing the rest to the goal domain's parser.
        let goal_domain = self.goal[0].domain();
        let prefix = format!("{}:", goal_domain.name());
        let native = rendered.strip_prefix(prefix.as_str()).unwrap_or(rendered);

        let query =
            parse_query(goal_domain, native).map_err(|source| RuleError::QueryInvalid {
                rule: self.name.clone(),
                source,
            })?;

        if !self.goal.contains(query.class()) {
            return Err(RuleError::GoalMismatch {
                rule: self.name.clone(),
                query: query.to_string(),
            });
        }

        Ok(Some(query))
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("goal", &self.goal)
            .finish()
    }
}

/// Shared rule handle; rules are immutable once built.
pub type RuleRef = Arc<Rule>;
