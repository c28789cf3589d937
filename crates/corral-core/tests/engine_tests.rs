use std::sync::Arc;
use std::time::Duration;

use corral_core::domains::mock::{MockDomain, MockStore};
use corral_core::{
    CancelToken, Class, Constraint, Domain, Engine, GraphStatus, Object, Rule,
};

/// Engine over a single mock domain, with a handle to its store.
fn mock_engine() -> (Engine, Arc<MockStore>) {
    let domain: Arc<dyn Domain> = Arc::new(MockDomain::new("mock"));
    let mut engine = Engine::new(vec![domain]).unwrap();
    let store = Arc::new(MockStore::new("mock"));
    engine.add_store_instance(store.clone());
    (engine, store)
}

fn obj(name: &str) -> Object {
    Object::new(serde_json::json!({ "name": name }))
}

fn class(engine: &Engine, name: &str) -> Class {
    engine.class(&format!("mock:{name}")).unwrap()
}

/// A -> B -> C via constant-query rules, one object per resolution.
fn chain_engine() -> (Engine, Arc<MockStore>) {
    let (mut engine, store) = mock_engine();
    engine
        .add_rule(rule(&engine, "R1", "A", "B", "B:fromA"))
        .unwrap();
    engine
        .add_rule(rule(&engine, "R2", "B", "C", "C:fromB"))
        .unwrap();
    store.add("mock:B:fromA", vec![obj("b1")]);
    store.add("mock:C:fromB", vec![obj("c1")]);
    (engine, store)
}

fn rule(engine: &Engine, name: &str, start: &str, goal: &str, template: &str) -> Rule {
    Rule::new(
        name,
        vec![class(engine, start)],
        vec![class(engine, goal)],
        template,
    )
    .unwrap()
}

async fn neighbours(engine: &Engine, seed: &str, depth: usize) -> corral_core::Graph {
    neighbours_with(engine, seed, depth, &Constraint::default()).await
}

async fn neighbours_with(
    engine: &Engine,
    seed: &str,
    depth: usize,
    constraint: &Constraint,
) -> corral_core::Graph {
    let a = class(engine, "A");
    engine
        .neighbours(
            vec![(a, vec![obj(seed)])],
            depth,
            constraint,
            &CancelToken::new(),
        )
        .await
        .unwrap()
}

fn node_classes(graph: &corral_core::Graph) -> Vec<String> {
    graph
        .nodes()
        .filter(|n| !n.is_empty())
        .map(|n| n.class().name().to_string())
        .collect()
}

#[tokio::test]
async fn test_depth_bound() {
    let (engine, _store) = chain_engine();

    let g1 = neighbours(&engine, "a1", 1).await;
    assert_eq!(node_classes(&g1), vec!["A", "B"]);

    let g2 = neighbours(&engine, "a1", 2).await;
    assert_eq!(node_classes(&g2), vec!["A", "B", "C"]);

    // No further rules apply; depth 3 matches depth 2.
    let g3 = neighbours(&engine, "a1", 3).await;
    assert_eq!(g3.snapshot(), g2.snapshot());
}

#[tokio::test]
async fn test_monotonicity_with_depth() {
    let (engine, _store) = chain_engine();

    let shallow = neighbours(&engine, "a1", 1).await;
    let deep = neighbours(&engine, "a1", 2).await;

    for node in shallow.nodes() {
        let deep_node = deep.node(node.class()).unwrap();
        for id in node.ids() {
            assert!(deep_node.contains(&id), "object lost at greater depth");
        }
    }
}

#[tokio::test]
async fn test_depth_zero_returns_seeds_only() {
    let (engine, _store) = chain_engine();
    let graph = neighbours(&engine, "a1", 0).await;

    assert_eq!(node_classes(&graph), vec!["A"]);
    assert!(graph.edges().is_empty());
    assert_eq!(graph.status(), GraphStatus::Done);
}

#[tokio::test]
async fn test_empty_rule_set_returns_seeds_only() {
    let (engine, _store) = mock_engine();
    let graph = neighbours(&engine, "a1", 5).await;

    assert_eq!(node_classes(&graph), vec!["A"]);
    assert!(graph.edges().is_empty());
}

#[tokio::test]
async fn test_total_limit_zero_returns_seeds_only() {
    let (engine, _store) = chain_engine();
    let constraint = Constraint::new().with_limit_total(0);
    let graph = neighbours_with(&engine, "a1", 3, &constraint).await;

    assert_eq!(node_classes(&graph), vec!["A"]);
    assert!(graph.edges().is_empty());
}

#[tokio::test]
async fn test_per_class_limit_rejects_silently() {
    let (mut engine, store) = mock_engine();
    engine
        .add_rule(rule(&engine, "R1", "A", "B", "B:fromA"))
        .unwrap();
    store.add("mock:B:fromA", vec![obj("b1"), obj("b2"), obj("b3")]);

    let constraint = Constraint::new().with_limit_per_class(2);
    let graph = neighbours_with(&engine, "a1", 1, &constraint).await;

    assert_eq!(graph.node(&class(&engine, "B")).unwrap().len(), 2);
    // Rejected insertions produce no edges and no errors.
    assert_eq!(graph.edges().len(), 2);
    assert!(graph.errors().is_empty());
}

#[tokio::test]
async fn test_cycle_tolerance() {
    let (mut engine, store) = mock_engine();
    engine
        .add_rule(rule(&engine, "AtoB", "A", "B", "B:x"))
        .unwrap();
    engine
        .add_rule(rule(&engine, "BtoA", "B", "A", "A:x"))
        .unwrap();
    store.add("mock:B:x", vec![obj("b1")]);
    // The reverse query returns the seed itself.
    store.add("mock:A:x", vec![obj("a1")]);

    let graph = neighbours(&engine, "a1", 5).await;

    assert_eq!(node_classes(&graph), vec!["A", "B"]);
    assert_eq!(graph.node(&class(&engine, "A")).unwrap().len(), 1);
    assert_eq!(graph.node(&class(&engine, "B")).unwrap().len(), 1);

    let edge_rules: Vec<&str> = graph.edges().iter().map(|e| e.rule.name()).collect();
    assert_eq!(edge_rules, vec!["AtoB", "BtoA"]);
}

#[tokio::test]
async fn test_transient_store_failure_retried() {
    let (engine, store) = chain_engine();
    // Fails twice; the third attempt inside the retry loop succeeds.
    store.fail("mock:B:fromA", 2);

    let graph = neighbours(&engine, "a1", 1).await;

    assert_eq!(graph.node(&class(&engine, "B")).unwrap().len(), 1);
    assert!(graph.errors().is_empty());
}

#[tokio::test]
async fn test_exhausted_retries_recorded_not_fatal() {
    let (engine, store) = chain_engine();
    // More failures than the retry budget (3 retries = 4 attempts).
    store.fail("mock:B:fromA", 10);

    let graph = neighbours(&engine, "a1", 2).await;

    assert_eq!(node_classes(&graph), vec!["A"]);
    assert_eq!(graph.errors().len(), 1);
    assert_eq!(graph.errors()[0].rule, "R1");
    assert_eq!(graph.status(), GraphStatus::Done);
}

#[tokio::test]
async fn test_cancellation_returns_partial_graph() {
    let (engine, store) = chain_engine();
    store.set_latency(Duration::from_millis(400));

    let cancel = CancelToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        // Level 1 (A -> B) completes around 400ms; level 2 is in flight.
        tokio::time::sleep(Duration::from_millis(600)).await;
        canceller.cancel();
    });

    let a = class(&engine, "A");
    let graph = engine
        .neighbours(
            vec![(a, vec![obj("a1")])],
            2,
            &Constraint::default(),
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(graph.status(), GraphStatus::Cancelled);
    assert!(graph.node(&class(&engine, "A")).is_some());
    assert!(graph.node(&class(&engine, "B")).is_some());
    assert!(graph.node(&class(&engine, "C")).is_none());
}

#[tokio::test]
async fn test_pre_cancelled_traversal_keeps_seeds() {
    let (engine, _store) = chain_engine();
    let cancel = CancelToken::new();
    cancel.cancel();

    let graph = engine
        .neighbours(
            vec![(class(&engine, "A"), vec![obj("a1")])],
            3,
            &Constraint::default(),
            &cancel,
        )
        .await
        .unwrap();

    assert_eq!(graph.status(), GraphStatus::Cancelled);
    assert_eq!(node_classes(&graph), vec!["A"]);
}

#[tokio::test]
async fn test_determinism_across_runs() {
    let (mut engine, store) = mock_engine();
    // Two rules fan out from A, so a level resolves multiple queries
    // concurrently; the merged graph must not depend on completion order.
    engine
        .add_rule(rule(&engine, "R1", "A", "B", "B:fromA"))
        .unwrap();
    engine
        .add_rule(rule(&engine, "R2", "A", "C", "C:fromA"))
        .unwrap();
    engine
        .add_rule(rule(&engine, "R3", "B", "C", "C:fromB"))
        .unwrap();
    store.add("mock:B:fromA", vec![obj("b1"), obj("b2")]);
    store.add("mock:C:fromA", vec![obj("c1"), obj("c2")]);
    store.add("mock:C:fromB", vec![obj("c3")]);

    let first = neighbours(&engine, "a1", 2).await;
    let second = neighbours(&engine, "a1", 2).await;
    assert_eq!(first.snapshot(), second.snapshot());
}

#[tokio::test]
async fn test_closure_every_object_is_seed_or_edge_target() {
    let (engine, _store) = chain_engine();
    let graph = neighbours(&engine, "a1", 2).await;

    let seed_id = class(&engine, "A").id(&obj("a1"));
    for node in graph.nodes() {
        for id in node.ids() {
            let is_seed = node.class().name() == "A" && id == seed_id;
            let is_target = graph
                .edges()
                .iter()
                .any(|e| e.to_class == *node.class() && e.to_id == id);
            assert!(is_seed || is_target, "orphan object {id} in {}", node.class());
        }
    }
}

#[tokio::test]
async fn test_edge_soundness() {
    let (engine, _store) = chain_engine();
    let graph = neighbours(&engine, "a1", 2).await;

    for edge in graph.edges() {
        // The rule's start set contains the source class and the goal set
        // contains the target class.
        assert!(edge.rule.start().contains(&edge.from_class));
        assert!(edge.rule.goal().contains(&edge.to_class));

        // Re-applying the rule to the source object reproduces the query.
        let from_obj = graph
            .node(&edge.from_class)
            .and_then(|n| n.get(&edge.from_id))
            .unwrap();
        let reproduced = edge.rule.apply(&edge.from_class, from_obj).unwrap().unwrap();
        assert_eq!(reproduced, edge.query);

        // The target object exists in the graph.
        assert!(graph
            .node(&edge.to_class)
            .map(|n| n.contains(&edge.to_id))
            .unwrap_or(false));
    }
}

#[tokio::test]
async fn test_missing_store_recorded_not_fatal() {
    let domain: Arc<dyn Domain> = Arc::new(MockDomain::new("mock"));
    let mut engine = Engine::new(vec![domain]).unwrap();
    // No store installed at all.
    engine
        .add_rule(rule(&engine, "R1", "A", "B", "B:fromA"))
        .unwrap();

    let graph = neighbours(&engine, "a1", 1).await;

    assert_eq!(node_classes(&graph), vec!["A"]);
    assert_eq!(graph.errors().len(), 1);
}

// =============================================================================
// Goals
// =============================================================================

#[tokio::test]
async fn test_goals_finds_chain_results() {
    let (engine, _store) = chain_engine();

    let a = class(&engine, "A");
    let c = class(&engine, "C");
    let graph = engine
        .goals(
            vec![(a, vec![obj("a1")])],
            &[c.clone()],
            &Constraint::default(),
            &CancelToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(graph.node(&c).unwrap().len(), 1);
    let rules: Vec<&str> = graph.edges().iter().map(|e| e.rule.name()).collect();
    assert_eq!(rules, vec!["R1", "R2"]);
}

#[tokio::test]
async fn test_goals_seed_already_in_goal_class() {
    let (engine, _store) = chain_engine();

    let a = class(&engine, "A");
    let graph = engine
        .goals(
            vec![(a.clone(), vec![obj("a1")])],
            &[a.clone()],
            &Constraint::default(),
            &CancelToken::new(),
        )
        .await
        .unwrap();

    // Coverage is satisfied at depth 0; no chains run.
    assert_eq!(graph.node(&a).unwrap().len(), 1);
    assert!(graph.edges().is_empty());
}

#[tokio::test]
async fn test_goals_determinism() {
    let (engine, _store) = chain_engine();
    let a = class(&engine, "A");
    let c = class(&engine, "C");

    let run = || async {
        engine
            .goals(
                vec![(a.clone(), vec![obj("a1")])],
                &[c.clone()],
                &Constraint::default(),
                &CancelToken::new(),
            )
            .await
            .unwrap()
    };
    assert_eq!(run().await.snapshot(), run().await.snapshot());
}
