//! Outgoing-edge resolution after a successful activation.

use weft_core::error::{Result, WeftError};
use weft_core::graph::{CompiledNode, Edge, NodeSpec};
use weft_core::types::RoutingState;

fn key_of(edge: &Edge) -> Option<&str> {
    edge.condition_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
}

fn matching<'a>(edges: &[&'a Edge], key: &str) -> Vec<&'a Edge> {
    edges
        .iter()
        .copied()
        .filter(|e| key_of(e) == Some(key))
        .collect()
}

fn unconditioned<'a>(edges: &[&'a Edge]) -> Vec<&'a Edge> {
    edges.iter().copied().filter(|e| e.is_unconditioned()).collect()
}

/// Pick the solid edges to follow out of `node`.
///
/// Decision nodes must produce a route key. It selects the edges whose
/// condition key matches, then the edges matching the node's
/// `fallback_route`, then the single unconditioned edge if there is exactly
/// one. Anything else is a graph-definition error.
///
/// Other nodes follow the edges matching their route key when one matches,
/// otherwise every unconditioned edge.
pub fn resolve<'a>(
    node: &CompiledNode,
    outgoing: impl IntoIterator<Item = &'a Edge>,
    routing: &RoutingState,
) -> Result<Vec<&'a Edge>> {
    let solid: Vec<&Edge> = outgoing.into_iter().filter(|e| e.is_solid()).collect();
    let key = routing
        .route_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty());

    if let NodeSpec::Decision { fallback_route } = &node.spec {
        let key = key.ok_or_else(|| {
            WeftError::GraphDefinition(format!("decision node {} produced no route key", node.id))
        })?;

        let hit = matching(&solid, key);
        if !hit.is_empty() {
            return Ok(hit);
        }
        if let Some(fallback) = fallback_route.as_deref().map(str::trim) {
            let hit = matching(&solid, fallback);
            if !hit.is_empty() {
                return Ok(hit);
            }
        }
        let open = unconditioned(&solid);
        if open.len() == 1 {
            return Ok(open);
        }
        return Err(WeftError::GraphDefinition(format!(
            "decision node {} has no edge for route key {:?}",
            node.id, key
        )));
    }

    if let Some(key) = key {
        let hit = matching(&solid, key);
        if !hit.is_empty() {
            return Ok(hit);
        }
    }
    Ok(unconditioned(&solid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_core::graph::{Node, NodeKind};

    fn edges() -> Vec<Edge> {
        vec![
            Edge::conditioned("e1", "n", "a", "A"),
            Edge::conditioned("e2", "n", "b", "B"),
            Edge::solid("e3", "n", "c"),
            Edge::dotted("e4", "n", "d"),
        ]
    }

    fn ids(edges: Vec<&Edge>) -> Vec<&str> {
        edges.iter().map(|e| e.id.as_str()).collect()
    }

    fn decision(fallback: Option<&str>) -> CompiledNode {
        let mut node = Node::new("n", NodeKind::Decision);
        if let Some(f) = fallback {
            node = node.with_config("fallback_route", json!(f));
        }
        CompiledNode::compile(&node).unwrap()
    }

    #[test]
    fn test_decision_follows_matching_key() {
        let edges = edges();
        let out = resolve(&decision(None), &edges, &RoutingState::route(" A ")).unwrap();
        assert_eq!(ids(out), vec!["e1"]);
    }

    #[test]
    fn test_decision_uses_fallback_route() {
        let edges = edges();
        let out = resolve(&decision(Some("B")), &edges, &RoutingState::route("Z")).unwrap();
        assert_eq!(ids(out), vec!["e2"]);
    }

    #[test]
    fn test_decision_uses_single_unconditioned_edge() {
        let edges = edges();
        let out = resolve(&decision(None), &edges, &RoutingState::route("Z")).unwrap();
        assert_eq!(ids(out), vec!["e3"]);
    }

    #[test]
    fn test_decision_without_route_key_is_definition_error() {
        let edges = edges();
        let err = resolve(&decision(None), &edges, &RoutingState::default()).unwrap_err();
        assert!(err.is_definition_error());
    }

    #[test]
    fn test_decision_with_no_usable_edge_fails() {
        let edges = vec![
            Edge::conditioned("e1", "n", "a", "A"),
            Edge::solid("e2", "n", "b"),
            Edge::solid("e3", "n", "c"),
        ];
        let err = resolve(&decision(None), &edges, &RoutingState::route("Z")).unwrap_err();
        assert!(err.is_definition_error());
    }

    #[test]
    fn test_task_fans_out_over_unconditioned_edges() {
        let task = CompiledNode::compile(&Node::new("n", NodeKind::Task)).unwrap();
        let edges = vec![
            Edge::solid("e1", "n", "a"),
            Edge::solid("e2", "n", "b"),
            Edge::conditioned("e3", "n", "c", "C"),
            Edge::dotted("e4", "n", "d"),
        ];
        let out = resolve(&task, &edges, &RoutingState::default()).unwrap();
        assert_eq!(ids(out), vec!["e1", "e2"]);

        let out = resolve(&task, &edges, &RoutingState::route("C")).unwrap();
        assert_eq!(ids(out), vec!["e3"]);

        let out = resolve(&task, &edges, &RoutingState::route("nope")).unwrap();
        assert_eq!(ids(out), vec!["e1", "e2"]);
    }
}
