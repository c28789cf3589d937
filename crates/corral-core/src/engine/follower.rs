//! Traversal: frontier expansion, parallel query resolution, merging.
//!
//! Each depth level runs in three steps:
//!
//! 1. **Expand** - apply every applicable rule to every frontier object,
//!    collecting queries. Identical queries from different (rule, object)
//!    pairs are deduplicated and resolved once; provenance is kept so each
//!    pair still gets its edge.
//! 2. **Resolve** - dispatch the level's queries concurrently, bounded by a
//!    semaphore. Workers send results over a channel; the traversal loop is
//!    the only graph writer.
//! 3. **Merge** - results are merged in sorted query order (dispatch order
//!    never leaks into the graph), then the level's edges are re-sorted by
//!    (rule name, from identity, to identity).
//!
//! Levels are strictly ordered: level d completes before any rule of level
//! d+1 fires. Cancellation is observed between steps and inside workers;
//! a cancelled traversal returns the graph built so far.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use crate::constraint::Constraint;
use crate::domain::{Class, Id, Object, Query};
use crate::graph::{FailureKind, Graph, GraphStatus, Inserted};
use crate::rule::{RuleError, RuleRef};
use crate::store::{get_with_retry, StoreError};

use super::{CancelToken, Engine, EngineError};

/// One (rule, source object) pair behind a query.
#[derive(Clone)]
struct Provenance {
    rule: RuleRef,
    from_class: Class,
    from_id: Id,
}

/// The deduplicated queries of one level, with their provenance.
#[derive(Default)]
struct Batch {
    queries: Vec<Query>,
    provenance: Vec<Vec<Provenance>>,
    lookup: HashMap<Query, usize>,
}

impl Batch {
    fn add(&mut self, query: Query, prov: Provenance) {
        match self.lookup.get(&query) {
            Some(&i) => self.provenance[i].push(prov),
            None => {
                self.lookup.insert(query.clone(), self.queries.len());
                self.queries.push(query);
                self.provenance.push(vec![prov]);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

type QueryResult = Result<Vec<Object>, (FailureKind, String)>;

/// Objects added at one level, grouped by class in first-seen order.
#[derive(Default)]
struct Frontier {
    order: Vec<Class>,
    by_class: HashMap<Class, Vec<Id>>,
}

impl Frontier {
    fn push(&mut self, class: Class, id: Id) {
        match self.by_class.get_mut(&class) {
            Some(ids) => ids.push(id),
            None => {
                self.order.push(class.clone());
                self.by_class.insert(class, vec![id]);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = (&Class, &Vec<Id>)> {
        self.order
            .iter()
            .filter_map(|class| self.by_class.get(class).map(|ids| (class, ids)))
    }
}

/// Runs one traversal over an engine's rules and stores.
pub(crate) struct Follower<'e> {
    engine: &'e Engine,
    constraint: Constraint,
    cancel: CancelToken,
    graph: Graph,
}

impl<'e> Follower<'e> {
    pub(crate) fn new(engine: &'e Engine, constraint: Constraint, cancel: CancelToken) -> Self {
        Self {
            engine,
            constraint,
            cancel,
            graph: Graph::new(),
        }
    }

    /// Depth-bounded breadth-first expansion from the seeds.
    pub(crate) async fn neighbours(
        mut self,
        seeds: Vec<(Class, Vec<Object>)>,
        depth: usize,
    ) -> Result<Graph, EngineError> {
        let mut frontier = self.insert_seeds(seeds);

        for level in 1..=depth {
            if self.cancel.is_cancelled() || frontier.is_empty() {
                break;
            }

            let batch = self.expand(&frontier);
            if batch.is_empty() {
                break;
            }
            tracing::debug!(level, queries = batch.queries.len(), "resolving level");

            let edge_start = self.graph.edges().len();
            let results = self.resolve(&batch).await;
            let mut next = Frontier::default();
            let within_limit = self.merge(&batch, results, &mut next);
            self.graph.sort_edges_from(edge_start);

            if !within_limit {
                break;
            }
            frontier = next;
        }

        if self.cancel.is_cancelled() {
            self.graph.set_status(GraphStatus::Cancelled);
        }
        Ok(self.graph)
    }

    /// Chain-directed search for objects of the goal classes.
    ///
    /// Candidate chains come from the rule index in (length, insertion
    /// order) order. Chains are applied until every seed object has
    /// produced at least one goal-class object or the total limit is hit.
    pub(crate) async fn goals(
        mut self,
        seeds: Vec<(Class, Vec<Object>)>,
        goal_classes: &[Class],
    ) -> Result<Graph, EngineError> {
        let frontier = self.insert_seeds(seeds);
        let goal_set: HashSet<&Class> = goal_classes.iter().collect();

        // Seed objects, each the root of its own descendancy set.
        let mut seed_objects: Vec<(Class, Id)> = Vec::new();
        let mut start_classes: Vec<Class> = Vec::new();
        for (class, ids) in frontier.iter() {
            if !start_classes.contains(class) {
                start_classes.push(class.clone());
            }
            for id in ids {
                seed_objects.push((class.clone(), id.clone()));
            }
        }

        // roots[(class, id)] = indices of seed objects this object descends from.
        let mut roots: HashMap<(Class, Id), HashSet<usize>> = HashMap::new();
        let mut covered: HashSet<usize> = HashSet::new();
        for (i, (class, id)) in seed_objects.iter().enumerate() {
            roots.insert((class.clone(), id.clone()), HashSet::from([i]));
            if goal_set.contains(class) {
                covered.insert(i);
            }
        }

        let chains = self.engine.rule_index().paths_between(
            &start_classes,
            goal_classes,
            self.engine.options().max_chain_depth,
        );
        tracing::debug!(chains = chains.len(), "goal chains enumerated");

        'chains: for chain in chains {
            if self.cancel.is_cancelled() {
                break;
            }
            if covered.len() == seed_objects.len() {
                break;
            }
            if self.total_limit_reached() {
                break;
            }

            // Stage 0 objects: the seeds this chain's first rule applies to.
            let mut stage: Vec<(Class, Id)> = seed_objects
                .iter()
                .filter(|(class, _)| chain[0].applies_to(class))
                .cloned()
                .collect();

            for rule in &chain {
                if stage.is_empty() {
                    continue 'chains;
                }
                if self.cancel.is_cancelled() || self.total_limit_reached() {
                    break 'chains;
                }

                let mut batch = Batch::default();
                for (class, id) in &stage {
                    self.apply_into_batch(rule, class, id, &mut batch);
                }
                if batch.is_empty() {
                    continue 'chains;
                }

                let edge_start = self.graph.edges().len();
                let results = self.resolve(&batch).await;
                let mut produced = Frontier::default();
                self.merge(&batch, results, &mut produced);
                self.graph.sort_edges_from(edge_start);

                // Propagate descendancy along this stage's edges and
                // collect the next stage (new and already-known objects).
                let mut next_stage: Vec<(Class, Id)> = Vec::new();
                let mut seen: HashSet<(Class, Id)> = HashSet::new();
                for edge in &self.graph.edges()[edge_start..] {
                    let from_key = (edge.from_class.clone(), edge.from_id.clone());
                    let to_key = (edge.to_class.clone(), edge.to_id.clone());
                    let from_roots = roots.get(&from_key).cloned().unwrap_or_default();
                    roots.entry(to_key.clone()).or_default().extend(from_roots);

                    if goal_set.contains(&edge.to_class) {
                        if let Some(r) = roots.get(&to_key) {
                            covered.extend(r.iter().copied());
                        }
                    }
                    if seen.insert(to_key.clone()) {
                        next_stage.push(to_key);
                    }
                }
                stage = next_stage;
            }
        }

        if self.cancel.is_cancelled() {
            self.graph.set_status(GraphStatus::Cancelled);
        }
        Ok(self.graph)
    }

    /// Inserts seed objects, bypassing constraint limits, and returns them
    /// as the initial frontier.
    fn insert_seeds(&mut self, seeds: Vec<(Class, Vec<Object>)>) -> Frontier {
        let mut frontier = Frontier::default();
        for (class, objects) in seeds {
            for obj in objects {
                if let Inserted::New(id) = self.graph.insert(&class, obj, None) {
                    frontier.push(class.clone(), id);
                }
            }
        }
        frontier
    }

    /// Applies every applicable rule to every frontier object.
    fn expand(&mut self, frontier: &Frontier) -> Batch {
        let mut batch = Batch::default();
        let mut work: Vec<(RuleRef, Class, Id)> = Vec::new();
        for (class, ids) in frontier.iter() {
            for rule in self.engine.rule_index().rules_from(class) {
                for id in ids {
                    work.push((rule.clone(), class.clone(), id.clone()));
                }
            }
        }
        for (rule, class, id) in work {
            self.apply_into_batch(&rule, &class, &id, &mut batch);
        }
        batch
    }

    /// Applies one rule to one stored object, recording failures on the
    /// graph and successful queries in the batch.
    fn apply_into_batch(&mut self, rule: &RuleRef, class: &Class, id: &Id, batch: &mut Batch) {
        let Some(obj) = self.graph.node(class).and_then(|n| n.get(id)).cloned() else {
            return;
        };
        match rule.apply(class, &obj) {
            Ok(Some(query)) => batch.add(
                query,
                Provenance {
                    rule: rule.clone(),
                    from_class: class.clone(),
                    from_id: id.clone(),
                },
            ),
            Ok(None) => {}
            Err(err) => {
                let kind = rule_failure_kind(&err);
                self.graph
                    .add_failure(rule.name(), id.to_string(), kind, err.to_string());
            }
        }
    }

    /// Resolves a batch of queries concurrently.
    ///
    /// Returns (query index, result) pairs sorted by query string, so the
    /// subsequent merge is independent of completion order. On
    /// cancellation, only results that arrived before the cancel are
    /// returned.
    async fn resolve(&self, batch: &Batch) -> Vec<(usize, QueryResult)> {
        let options = self.engine.options();
        let semaphore = Arc::new(Semaphore::new(options.worker_pool.max(1)));
        let (tx, mut rx) = mpsc::channel::<(usize, QueryResult)>(batch.queries.len().max(1));

        let mut results: Vec<(usize, QueryResult)> = Vec::new();
        let mut dispatched = 0usize;

        for (i, query) in batch.queries.iter().enumerate() {
            let domain = query.class().domain_name();
            let Some(store) = self.engine.store(domain) else {
                results.push((
                    i,
                    Err((
                        FailureKind::StoreMissing,
                        format!("no store configured for domain {domain:?}"),
                    )),
                ));
                continue;
            };

            let store = Arc::clone(store);
            let query = query.clone();
            let constraint = self.constraint.clone();
            let retry = options.retry.clone();
            let timeout = options.query_timeout;
            let cancel = self.cancel.clone();
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();
            dispatched += 1;

            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let fetch = async {
                    let mut out = Vec::new();
                    get_with_retry(store.as_ref(), &query, &constraint, &retry, &mut out)
                        .await
                        .map(|_| out)
                };
                let result = tokio::select! {
                    _ = cancel.cancelled() => return,
                    outcome = tokio::time::timeout(timeout, fetch) => match outcome {
                        Ok(Ok(objects)) => Ok(objects),
                        Ok(Err(err)) => Err((store_failure_kind(&err), err.to_string())),
                        Err(_) => Err((FailureKind::Timeout, "query timed out".to_string())),
                    },
                };
                let _ = tx.send((i, result)).await;
            });
        }
        drop(tx);

        let mut received = 0usize;
        while received < dispatched {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(result) => {
                        results.push(result);
                        received += 1;
                    }
                    None => break,
                },
            }
        }

        results.sort_by(|(a, _), (b, _)| {
            batch.queries[*a]
                .to_string()
                .cmp(&batch.queries[*b].to_string())
        });
        results
    }

    /// Merges resolved objects into the graph under the constraint,
    /// recording edges and failures. Returns false once the total-result
    /// limit stops the traversal.
    fn merge(
        &mut self,
        batch: &Batch,
        results: Vec<(usize, QueryResult)>,
        next: &mut Frontier,
    ) -> bool {
        for (idx, result) in results {
            let query = &batch.queries[idx];
            let provenance = &batch.provenance[idx];
            match result {
                Err((kind, message)) => {
                    for prov in provenance {
                        self.graph.add_failure(
                            prov.rule.name(),
                            prov.from_id.to_string(),
                            kind,
                            message.clone(),
                        );
                    }
                }
                Ok(objects) => {
                    let step_cap = self.constraint.limit_per_step.unwrap_or(usize::MAX);
                    for obj in objects.into_iter().take(step_cap) {
                        if self.total_limit_reached() {
                            return false;
                        }
                        let class = query.class();
                        match self
                            .graph
                            .insert(class, obj, self.constraint.limit_per_class)
                        {
                            Inserted::New(id) => {
                                self.graph.count_merged();
                                next.push(class.clone(), id.clone());
                                self.record_edges(provenance, class, &id, query);
                            }
                            Inserted::Existing(id) => {
                                self.record_edges(provenance, class, &id, query);
                            }
                            Inserted::Rejected => {}
                        }
                    }
                }
            }
        }
        !self.total_limit_reached()
    }

    fn record_edges(&mut self, provenance: &[Provenance], to_class: &Class, to_id: &Id, query: &Query) {
        for prov in provenance {
            self.graph.add_edge(
                prov.rule.clone(),
                prov.from_class.clone(),
                prov.from_id.clone(),
                to_class.clone(),
                to_id.clone(),
                query.clone(),
            );
        }
    }

    fn total_limit_reached(&self) -> bool {
        self.constraint
            .limit_total
            .is_some_and(|limit| self.graph.merged_count() >= limit)
    }
}

fn rule_failure_kind(err: &RuleError) -> FailureKind {
    match err {
        RuleError::QueryInvalid { .. } => FailureKind::QueryInvalid,
        RuleError::GoalMismatch { .. } => FailureKind::GoalMismatch,
        _ => FailureKind::TemplateFailed,
    }
}

fn store_failure_kind(err: &StoreError) -> FailureKind {
    match err {
        StoreError::Unavailable(_) => FailureKind::StoreUnavailable,
        StoreError::BadQuery { .. } => FailureKind::BadQuery,
        StoreError::ClassMismatch { .. } => FailureKind::ClassMismatch,
        StoreError::BadParams { .. } => FailureKind::BadQuery,
    }
}
