//! The correlation graph: accumulated objects and rule applications.
//!
//! One graph is created per traversal, grows monotonically while the
//! traversal runs, and is returned to the caller. Nodes are class arenas
//! (insertion-ordered object lists with a by-identity index); edges are
//! tuples over (rule, from, to, query), deduplicated. Non-fatal rule
//! failures are recorded here instead of aborting the traversal.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::domain::{Class, Id, Object, Query};
use crate::rule::RuleRef;

/// Terminal status of the traversal that produced a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphStatus {
    /// Traversal ran to completion.
    Done,
    /// Traversal was cancelled; the graph is a consistent prefix.
    Cancelled,
    /// The traversal deadline expired; the graph is a consistent prefix.
    TimedOut,
}

/// Outcome of a [`Graph::insert`] attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inserted {
    /// The object was new and is now stored.
    New(Id),
    /// An object with the same identity already existed; it was kept.
    Existing(Id),
    /// A per-class limit rejected the insertion.
    Rejected,
}

/// One class's objects.
pub struct Node {
    class: Class,
    objects: Vec<Object>,
    by_id: HashMap<Id, usize>,
}

impl Node {
    fn new(class: Class) -> Self {
        Self {
            class,
            objects: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    pub fn class(&self) -> &Class {
        &self.class
    }

    /// Objects in first-insertion order.
    pub fn objects(&self) -> &[Object] {
        &self.objects
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, id: &Id) -> Option<&Object> {
        self.by_id.get(id).map(|&i| &self.objects[i])
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.by_id.contains_key(id)
    }

    /// Identities in first-insertion order.
    pub fn ids(&self) -> Vec<Id> {
        let mut ids: Vec<(usize, &Id)> = self.by_id.iter().map(|(id, &i)| (i, id)).collect();
        ids.sort_by_key(|(i, _)| *i);
        ids.into_iter().map(|(_, id)| id.clone()).collect()
    }
}

/// A rule application: `rule` applied to `from` produced `query`, whose
/// result included `to`.
#[derive(Debug, Clone)]
pub struct Edge {
    pub rule: RuleRef,
    pub from_class: Class,
    pub from_id: Id,
    pub to_class: Class,
    pub to_id: Id,
    pub query: Query,
}

/// Kind of a non-fatal failure recorded during traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TemplateFailed,
    QueryInvalid,
    GoalMismatch,
    StoreUnavailable,
    BadQuery,
    ClassMismatch,
    StoreMissing,
    Timeout,
}

/// A failure scoped to one (rule, source object) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleFailure {
    pub rule: String,
    pub object: String,
    pub kind: FailureKind,
    pub message: String,
}

/// The mutable accumulator of one traversal.
pub struct Graph {
    nodes: Vec<Node>,
    node_index: HashMap<Class, usize>,
    edges: Vec<Edge>,
    edge_keys: HashSet<(String, Class, Id, Class, Id)>,
    errors: Vec<RuleFailure>,
    status: GraphStatus,
    merged: usize,
}

impl Graph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            node_index: HashMap::new(),
            edges: Vec::new(),
            edge_keys: HashSet::new(),
            errors: Vec::new(),
            status: GraphStatus::Done,
            merged: 0,
        }
    }

    fn node_mut(&mut self, class: &Class) -> &mut Node {
        if let Some(&i) = self.node_index.get(class) {
            return &mut self.nodes[i];
        }
        let i = self.nodes.len();
        self.nodes.push(Node::new(class.clone()));
        self.node_index.insert(class.clone(), i);
        &mut self.nodes[i]
    }

    /// Inserts `obj` under `class`, deduplicating by identity.
    ///
    /// `limit_per_class` rejects insertions into a node already at the cap;
    /// rejections are silent (no error, no edge).
    pub fn insert(
        &mut self,
        class: &Class,
        obj: Object,
        limit_per_class: Option<usize>,
    ) -> Inserted {
        let id = class.id(&obj);
        let node = self.node_mut(class);
        if node.contains(&id) {
            return Inserted::Existing(id);
        }
        if let Some(cap) = limit_per_class {
            if node.objects.len() >= cap {
                return Inserted::Rejected;
            }
        }
        node.by_id.insert(id.clone(), node.objects.len());
        node.objects.push(obj);
        Inserted::New(id)
    }

    /// Records a rule application edge, idempotent on
    /// (rule, from identity, to identity).
    pub fn add_edge(
        &mut self,
        rule: RuleRef,
        from_class: Class,
        from_id: Id,
        to_class: Class,
        to_id: Id,
        query: Query,
    ) -> bool {
        let key = (
            rule.name().to_string(),
            from_class.clone(),
            from_id.clone(),
            to_class.clone(),
            to_id.clone(),
        );
        if !self.edge_keys.insert(key) {
            return false;
        }
        self.edges.push(Edge {
            rule,
            from_class,
            from_id,
            to_class,
            to_id,
            query,
        });
        true
    }

    /// Records a non-fatal failure against a (rule, object) pair.
    pub fn add_failure(
        &mut self,
        rule: &str,
        object: impl Into<String>,
        kind: FailureKind,
        message: impl Into<String>,
    ) {
        self.errors.push(RuleFailure {
            rule: rule.to_string(),
            object: object.into(),
            kind,
            message: message.into(),
        });
    }

    /// Node lookup by class.
    pub fn node(&self, class: &Class) -> Option<&Node> {
        self.node_index.get(class).map(|&i| &self.nodes[i])
    }

    /// Nodes in first-insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Edges in recorded order (canonical after each traversal level).
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Non-fatal failures recorded during the traversal.
    pub fn errors(&self) -> &[RuleFailure] {
        &self.errors
    }

    pub fn status(&self) -> GraphStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: GraphStatus) {
        self.status = status;
    }

    /// Objects merged from stores (seeds excluded).
    pub(crate) fn merged_count(&self) -> usize {
        self.merged
    }

    pub(crate) fn count_merged(&mut self) {
        self.merged += 1;
    }

    /// Total objects across all nodes.
    pub fn object_count(&self) -> usize {
        self.nodes.iter().map(Node::len).sum()
    }

    /// Restores deterministic edge order for edges appended since
    /// `from`: sort by (rule name, from identity, to identity).
    pub(crate) fn sort_edges_from(&mut self, from: usize) {
        self.edges[from..].sort_by(|a, b| {
            (a.rule.name(), &a.from_id, &a.to_id).cmp(&(b.rule.name(), &b.from_id, &b.to_id))
        });
    }

    /// A serializable snapshot for output and comparison.
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            status: self.status,
            nodes: self
                .nodes
                .iter()
                .map(|n| NodeSnapshot {
                    class: n.class.full_name(),
                    count: n.len(),
                    objects: n.objects.clone(),
                })
                .collect(),
            edges: self
                .edges
                .iter()
                .map(|e| EdgeSnapshot {
                    rule: e.rule.name().to_string(),
                    from: format!("{}/{}", e.from_class.full_name(), e.from_id),
                    to: format!("{}/{}", e.to_class.full_name(), e.to_id),
                    query: e.query.to_string(),
                })
                .collect(),
            errors: self.errors.clone(),
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializable view of a graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphSnapshot {
    pub status: GraphStatus,
    pub nodes: Vec<NodeSnapshot>,
    pub edges: Vec<EdgeSnapshot>,
    pub errors: Vec<RuleFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSnapshot {
    pub class: String,
    pub count: usize,
    pub objects: Vec<Object>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeSnapshot {
    pub rule: String,
    pub from: String,
    pub to: String,
    pub query: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Class, Domain, Object};
    use crate::domains::mock::MockDomain;
    use crate::rule::Rule;
    use std::sync::Arc;

    fn classes() -> (Class, Class) {
        let d: Arc<dyn Domain> = Arc::new(MockDomain::new("mock"));
        (
            Class::new(Arc::clone(&d), "A"),
            Class::new(Arc::clone(&d), "B"),
        )
    }

    fn obj(name: &str) -> Object {
        Object::new(serde_json::json!({ "name": name }))
    }

    #[test]
    fn test_insert_dedups_by_identity() {
        let (a, _) = classes();
        let mut graph = Graph::new();

        let first = graph.insert(&a, obj("x"), None);
        assert!(matches!(first, Inserted::New(_)));

        let second = graph.insert(&a, obj("x"), None);
        assert!(matches!(second, Inserted::Existing(_)));

        assert_eq!(graph.node(&a).unwrap().len(), 1);
    }

    #[test]
    fn test_per_class_limit_rejects() {
        let (a, _) = classes();
        let mut graph = Graph::new();

        assert!(matches!(graph.insert(&a, obj("1"), Some(1)), Inserted::New(_)));
        assert_eq!(graph.insert(&a, obj("2"), Some(1)), Inserted::Rejected);
        // Existing identities are still reported as existing, not rejected.
        assert!(matches!(
            graph.insert(&a, obj("1"), Some(1)),
            Inserted::Existing(_)
        ));
    }

    #[test]
    fn test_edges_deduplicate() {
        let (a, b) = classes();
        let rule = Arc::new(
            Rule::new("r", vec![a.clone()], vec![b.clone()], "B:{{ name }}").unwrap(),
        );
        let query = Query::new(b.clone(), "x");

        let mut graph = Graph::new();
        let from = Id::new("a1");
        let to = Id::new("b1");
        assert!(graph.add_edge(
            rule.clone(),
            a.clone(),
            from.clone(),
            b.clone(),
            to.clone(),
            query.clone()
        ));
        assert!(!graph.add_edge(rule, a, from, b, to, query));
        assert_eq!(graph.edges().len(), 1);
    }

    #[test]
    fn test_nodes_iterate_in_insertion_order() {
        let (a, b) = classes();
        let mut graph = Graph::new();
        graph.insert(&b, obj("1"), None);
        graph.insert(&a, obj("2"), None);

        let order: Vec<String> = graph.nodes().map(|n| n.class().full_name()).collect();
        assert_eq!(order, vec!["mock:B", "mock:A"]);
    }
}
