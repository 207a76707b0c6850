use std::collections::{BTreeSet, HashMap, HashSet};

use weft_core::graph::{CompiledGraph, Edge, EdgeMode};

/// Adjacency of a compiled graph, computed once per run.
///
/// A solid edge that closes a cycle (a back edge in a depth-first walk from
/// `start`) is not a join requirement of its target: a token arriving on it
/// activates the target on its own. Every other solid parent is required.
#[derive(Debug, Default)]
pub struct Topology {
    outgoing: HashMap<String, Vec<Edge>>,
    incoming: HashMap<String, Vec<Edge>>,
    required: HashMap<String, BTreeSet<String>>,
    back_edges: HashSet<String>,
}

impl Topology {
    pub fn build(graph: &CompiledGraph) -> Self {
        let mut topo = Self::default();
        for edge in &graph.edges {
            topo.outgoing
                .entry(edge.source_node_id.clone())
                .or_default()
                .push(edge.clone());
            topo.incoming
                .entry(edge.target_node_id.clone())
                .or_default()
                .push(edge.clone());
        }

        topo.back_edges = topo.find_back_edges(&graph.start_node_id);

        for edge in graph.edges.iter().filter(|e| e.mode == EdgeMode::Solid) {
            if topo.back_edges.contains(&edge.id) {
                continue;
            }
            topo.required
                .entry(edge.target_node_id.clone())
                .or_default()
                .insert(edge.source_node_id.clone());
        }
        topo
    }

    /// Iterative DFS over solid edges; returns ids of edges into a node that
    /// is still on the stack.
    fn find_back_edges<'a>(&'a self, start: &'a str) -> HashSet<String> {
        let mut back = HashSet::new();
        let mut on_stack: HashSet<&str> = HashSet::new();
        let mut visited: HashSet<&str> = HashSet::new();
        // (node, index of the next outgoing edge to inspect)
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        visited.insert(start);
        on_stack.insert(start);

        while let Some((node, next)) = stack.pop() {
            let solid: Vec<&Edge> = self.solid_outgoing(node).collect();
            if next >= solid.len() {
                on_stack.remove(node);
                continue;
            }
            stack.push((node, next + 1));
            let edge = solid[next];
            let target = edge.target_node_id.as_str();
            if on_stack.contains(target) {
                back.insert(edge.id.clone());
            } else if visited.insert(target) {
                on_stack.insert(target);
                stack.push((target, 0));
            }
        }
        back
    }

    pub fn outgoing(&self, node_id: &str) -> &[Edge] {
        self.outgoing.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn incoming(&self, node_id: &str) -> &[Edge] {
        self.incoming.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn solid_outgoing<'a>(&'a self, node_id: &str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.outgoing(node_id).iter().filter(|e| e.is_solid())
    }

    /// Sources of dotted edges into `node_id`.
    pub fn dotted_sources<'a>(&'a self, node_id: &str) -> impl Iterator<Item = &'a str> + 'a {
        self.incoming(node_id)
            .iter()
            .filter(|e| e.mode == EdgeMode::Dotted)
            .map(|e| e.source_node_id.as_str())
    }

    /// Solid parents `node_id` must hear from before it activates.
    pub fn required_parents(&self, node_id: &str) -> Option<&BTreeSet<String>> {
        self.required.get(node_id)
    }

    #[cfg(test)]
    pub fn is_back_edge(&self, edge_id: &str) -> bool {
        self.back_edges.contains(edge_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_test_utils::builders::{diamond, GraphBuilder};

    fn compile(graph: weft_core::graph::Graph) -> CompiledGraph {
        CompiledGraph::compile(&graph).unwrap()
    }

    #[test]
    fn test_diamond_join_requires_both_branches() {
        let topo = Topology::build(&compile(diamond("g")));
        let required: Vec<&str> = topo
            .required_parents("join")
            .unwrap()
            .iter()
            .map(String::as_str)
            .collect();
        assert_eq!(required, vec!["left", "right"]);
        assert_eq!(topo.solid_outgoing("start").count(), 2);
        assert!(topo.required_parents("start").is_none());
    }

    #[test]
    fn test_loop_edge_is_not_a_join_requirement() {
        let graph = GraphBuilder::new("g")
            .start("start")
            .task("work")
            .decision("check")
            .end("end")
            .edge("start", "work")
            .edge("work", "check")
            .route("check", "work", "again")
            .route("check", "end", "done")
            .build();
        let topo = Topology::build(&compile(graph));

        assert!(topo.is_back_edge("e3"));
        assert!(!topo.is_back_edge("e1"));
        let required = topo.required_parents("work").unwrap();
        assert_eq!(required.len(), 1);
        assert!(required.contains("start"));
    }

    #[test]
    fn test_dotted_edges_are_context_only() {
        let graph = GraphBuilder::new("g")
            .start("start")
            .task("a")
            .task("b")
            .edge("start", "a")
            .edge("a", "b")
            .dotted("start", "b")
            .build();
        let topo = Topology::build(&compile(graph));
        assert_eq!(topo.dotted_sources("b").collect::<Vec<_>>(), vec!["start"]);
        assert_eq!(topo.required_parents("b").unwrap().len(), 1);
        assert_eq!(topo.incoming("b").len(), 2);
    }
}
