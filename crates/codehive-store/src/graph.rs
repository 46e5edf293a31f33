//! Directed dependency graph with iterative cycle detection

use std::collections::{BTreeMap, BTreeSet, HashSet};

use codehive_core::DependencyEdge;

/// Adjacency view over one level's edge set
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_edges<'a>(edges: impl IntoIterator<Item = &'a DependencyEdge>) -> Self {
        let mut graph = Self::new();
        for edge in edges {
            graph.add_edge(&edge.from_id, &edge.to_id);
        }
        graph
    }

    pub fn add_edge(&mut self, from: &str, to: &str) {
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        self.edges.entry(to.to_string()).or_default();
    }

    /// Keep only edges whose endpoints are both in `nodes`
    pub fn restrict_to(&self, nodes: &HashSet<String>) -> Self {
        let mut graph = Self::new();
        for (from, targets) in &self.edges {
            if !nodes.contains(from) {
                continue;
            }
            for to in targets.iter().filter(|t| nodes.contains(*t)) {
                graph.add_edge(from, to);
            }
        }
        graph
    }

    /// True when `to` is reachable from `from`
    pub fn has_path(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }
        let mut visited = HashSet::new();
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            if let Some(targets) = self.edges.get(node) {
                for next in targets {
                    if next == to {
                        return true;
                    }
                    stack.push(next.as_str());
                }
            }
        }
        false
    }

    /// Would adding `from -> to` close a cycle?
    pub fn would_cycle(&self, from: &str, to: &str) -> bool {
        self.has_path(to, from)
    }

    /// Return the nodes of one cycle, in order, if any exists
    ///
    /// Depth-first with an explicit stack; `on_stack` marks the current path.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut on_stack: HashSet<&str> = HashSet::new();

        for start in self.edges.keys() {
            if visited.contains(start.as_str()) {
                continue;
            }

            // (node, index of next child to explore)
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            visited.insert(start);
            on_stack.insert(start);

            while let Some((node, child_idx)) = stack.last().copied() {
                let children = self.edges.get(node);
                let next = children.and_then(|c| c.iter().nth(child_idx));

                match next {
                    Some(child) => {
                        if let Some(top) = stack.last_mut() {
                            top.1 += 1;
                        }
                        let child = child.as_str();
                        if on_stack.contains(child) {
                            let begin = stack.iter().position(|(n, _)| *n == child).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                stack[begin..].iter().map(|(n, _)| n.to_string()).collect();
                            cycle.push(child.to_string());
                            return Some(cycle);
                        }
                        if visited.insert(child) {
                            on_stack.insert(child);
                            stack.push((child, 0));
                        }
                    }
                    None => {
                        on_stack.remove(node);
                        stack.pop();
                    }
                }
            }
        }

        None
    }

    pub fn node_count(&self) -> usize {
        self.edges.len()
    }
}
