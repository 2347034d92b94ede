//! Start order of session members.

use crate::error::{ServiceError, ServiceResult};
use std::collections::{HashMap, HashSet};

/// Dependency graph between session members
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Insertion order, used to keep layers stable
    order: Vec<String>,
    nodes: HashSet<String>,
    /// `edges[A] = [B, C]` means A depends on B and C
    edges: HashMap<String, Vec<String>>,
    /// `reverse[A] = [B, C]` means B and C depend on A
    reverse: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node to the graph
    pub fn add_node(&mut self, name: &str) {
        if self.nodes.insert(name.to_string()) {
            self.order.push(name.to_string());
        }
        self.edges.entry(name.to_string()).or_default();
        self.reverse.entry(name.to_string()).or_default();
    }

    /// Add a dependency edge (`from` depends on `to`)
    pub fn add_edge(&mut self, from: &str, to: &str) {
        self.add_node(from);
        self.add_node(to);

        let deps = self.edges.entry(from.to_string()).or_default();
        if !deps.iter().any(|d| d == to) {
            deps.push(to.to_string());
            self.reverse
                .entry(to.to_string())
                .or_default()
                .push(from.to_string());
        }
    }

    /// Direct dependencies of a node
    pub fn dependencies(&self, node: &str) -> &[String] {
        self.edges.get(node).map(Vec::as_slice).unwrap_or_default()
    }

    /// Nodes that depend directly on the given node
    pub fn dependents(&self, node: &str) -> &[String] {
        self.reverse.get(node).map(Vec::as_slice).unwrap_or_default()
    }

    /// Groups of nodes that can run concurrently, dependencies first.
    ///
    /// Each layer keeps insertion order. Fails with
    /// [`ServiceError::DependencyCycle`] carrying the cycle path.
    pub fn layers(&self) -> ServiceResult<Vec<Vec<String>>> {
        let mut in_degree: HashMap<&str, usize> = self
            .order
            .iter()
            .map(|node| (node.as_str(), self.dependencies(node).len()))
            .collect();

        let mut layers = Vec::new();
        let mut processed = 0;
        while processed < self.order.len() {
            let layer: Vec<String> = self
                .order
                .iter()
                .filter(|node| in_degree.get(node.as_str()) == Some(&0))
                .cloned()
                .collect();

            if layer.is_empty() {
                return Err(ServiceError::DependencyCycle(self.find_cycle()));
            }

            for node in &layer {
                in_degree.remove(node.as_str());
                for dependent in self.dependents(node) {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree = degree.saturating_sub(1);
                    }
                }
            }
            processed += layer.len();
            layers.push(layer);
        }
        Ok(layers)
    }

    /// Find a cycle in the graph and return it as a path
    fn find_cycle(&self) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for node in &self.order {
            if !visited.contains(node) {
                if let Some(cycle) =
                    self.find_cycle_dfs(node, &mut visited, &mut rec_stack, &mut path)
                {
                    return cycle;
                }
            }
        }
        Vec::new()
    }

    fn find_cycle_dfs(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node.to_string());
        rec_stack.insert(node.to_string());
        path.push(node.to_string());

        for dep in self.dependencies(node) {
            if !visited.contains(dep) {
                if let Some(cycle) = self.find_cycle_dfs(dep, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(dep) {
                let start = path.iter().position(|n| n == dep).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(dep.clone());
                return Some(cycle);
            }
        }

        rec_stack.remove(node);
        path.pop();
        None
    }
}
