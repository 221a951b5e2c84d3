#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Directed edge set keyed by source node. Built from the dependency table
/// inside the same transaction that wants to mutate it, so the reachability
/// answer cannot race with a concurrent insert.
#[derive(Clone, Debug, Default)]
pub struct EdgeSet {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl EdgeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut set = Self::new();
        for (from, to) in pairs {
            set.insert(from, to);
        }
        set
    }

    pub fn insert(&mut self, from: String, to: String) {
        self.edges.entry(from).or_default().insert(to);
    }

    pub fn contains(&self, from: &str, to: &str) -> bool {
        self.edges
            .get(from)
            .is_some_and(|targets| targets.contains(to))
    }

    /// Breadth-first reachability over the edge set. Used by the cycle guard:
    /// adding `task -> dep` is rejected when `dep` already reaches `task`.
    pub fn reaches(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(from);
        seen.insert(from);
        while let Some(node) = queue.pop_front() {
            let Some(targets) = self.edges.get(node) else {
                continue;
            };
            for target in targets {
                if target == to {
                    return true;
                }
                if seen.insert(target.as_str()) {
                    queue.push_back(target);
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::EdgeSet;

    fn edges(pairs: &[(&str, &str)]) -> EdgeSet {
        EdgeSet::from_pairs(
            pairs
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string())),
        )
    }

    #[test]
    fn reaches_follows_transitive_chains() {
        let g = edges(&[("a", "b"), ("b", "c"), ("c", "d")]);
        assert!(g.reaches("a", "d"));
        assert!(!g.reaches("d", "a"));
    }

    #[test]
    fn reaches_is_reflexive() {
        let g = edges(&[]);
        assert!(g.reaches("x", "x"));
    }

    #[test]
    fn diamond_shapes_are_handled_once() {
        let g = edges(&[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")]);
        assert!(g.reaches("a", "d"));
        assert!(!g.reaches("b", "c"));
    }

    #[test]
    fn contains_checks_direct_edges_only() {
        let g = edges(&[("a", "b"), ("b", "c")]);
        assert!(g.contains("a", "b"));
        assert!(!g.contains("a", "c"));
    }
}
