//! Rule index: fast lookup of applicable rules and rule chains.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::domain::Class;

use super::RuleRef;

/// Indexes rules by start class and answers path queries over the
/// bipartite class/rule graph. Immutable once built.
pub struct RuleIndex {
    rules: Vec<RuleRef>,
    by_start: HashMap<Class, Vec<usize>>,
}

impl RuleIndex {
    /// Builds an index. Rule order is preserved: all orderings derived
    /// from the index follow rule insertion order.
    pub fn new(rules: &[RuleRef]) -> Self {
        let mut by_start: HashMap<Class, Vec<usize>> = HashMap::new();
        for (i, rule) in rules.iter().enumerate() {
            for class in rule.start() {
                by_start.entry(class.clone()).or_default().push(i);
            }
        }
        Self {
            rules: rules.to_vec(),
            by_start,
        }
    }

    /// All indexed rules, in insertion order.
    pub fn rules(&self) -> &[RuleRef] {
        &self.rules
    }

    /// Rules whose start set contains `class`, in insertion order.
    pub fn rules_from(&self, class: &Class) -> Vec<RuleRef> {
        self.by_start
            .get(class)
            .map(|idxs| idxs.iter().map(|&i| self.rules[i].clone()).collect())
            .unwrap_or_default()
    }

    /// Rule chains of length ≤ `max_depth` leading from any of `starts`
    /// to any of `goals`.
    ///
    /// BFS over the class/rule graph: chains are yielded in increasing
    /// length, ties broken by rule insertion order, and no chain revisits
    /// a class (runtime dedup handles value-level cycles).
    pub fn paths_between(
        &self,
        starts: &[Class],
        goals: &[Class],
        max_depth: usize,
    ) -> Vec<Vec<RuleRef>> {
        let goal_set: HashSet<&Class> = goals.iter().collect();
        let mut chains: Vec<Vec<usize>> = Vec::new();
        let mut seen_chains: HashSet<Vec<usize>> = HashSet::new();

        // Queue entries: (current class, chain of rule indices, visited classes).
        let mut queue: VecDeque<(Class, Vec<usize>, HashSet<Class>)> = VecDeque::new();
        for start in starts {
            let mut visited = HashSet::new();
            visited.insert(start.clone());
            queue.push_back((start.clone(), Vec::new(), visited));
        }

        while let Some((class, chain, visited)) = queue.pop_front() {
            if chain.len() >= max_depth {
                continue;
            }
            let Some(rule_idxs) = self.by_start.get(&class) else {
                continue;
            };
            for &idx in rule_idxs {
                let rule = &self.rules[idx];
                let mut next_chain = chain.clone();
                next_chain.push(idx);

                if rule.goal().iter().any(|g| goal_set.contains(g)) {
                    if seen_chains.insert(next_chain.clone()) {
                        chains.push(next_chain.clone());
                    }
                }

                for goal in rule.goal() {
                    if visited.contains(goal) {
                        continue;
                    }
                    let mut next_visited = visited.clone();
                    next_visited.insert(goal.clone());
                    queue.push_back((goal.clone(), next_chain.clone(), next_visited));
                }
            }
        }

        chains
            .into_iter()
            .map(|chain| chain.into_iter().map(|i| self.rules[i].clone()).collect())
            .collect()
    }
}
