//! Node-type dispatch: which compute callback serves which node type.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;

use weft_core::error::{Result, WeftError};
use weft_core::graph::NodeKind;
use weft_core::traits::NodeCompute;
use weft_core::types::{ComputeOutput, ComputeRequest, RoutingState};

/// Lookup table `node type -> compute callback`.
#[derive(Default, Clone)]
pub struct DispatchTable {
    by_kind: HashMap<NodeKind, Arc<dyn NodeCompute>>,
    fallback: Option<Arc<dyn NodeCompute>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table that serves every node type with `compute`.
    pub fn uniform(compute: Arc<dyn NodeCompute>) -> Self {
        Self {
            by_kind: HashMap::new(),
            fallback: Some(compute),
        }
    }

    pub fn register(&mut self, kind: NodeKind, compute: Arc<dyn NodeCompute>) {
        self.by_kind.insert(kind, compute);
    }

    pub fn with(mut self, kind: NodeKind, compute: Arc<dyn NodeCompute>) -> Self {
        self.register(kind, compute);
        self
    }

    pub fn get(&self, kind: NodeKind) -> Result<Arc<dyn NodeCompute>> {
        self.by_kind
            .get(&kind)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| WeftError::ComputeNotFound(kind.as_str().to_string()))
    }
}

/// Compute that echoes the activation back and takes its routing from the
/// node config: `route` sets the route key, `terminate = true` ends the run.
///
/// Used by the operator CLI to dry-run a graph's control flow.
pub struct EchoCompute;

impl NodeCompute for EchoCompute {
    fn compute(&self, request: ComputeRequest) -> BoxFuture<'_, Result<ComputeOutput>> {
        Box::pin(async move {
            let mut routing = RoutingState::default();
            if let Some(route) = request.node.config.get("route").and_then(|v| v.as_str()) {
                routing.route_key = Some(route.to_string());
            }
            routing.terminate_run = request
                .node
                .config
                .get("terminate")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);

            let parents: Vec<&str> = request
                .input
                .tokens
                .iter()
                .map(|t| t.source_node_id.as_str())
                .collect();
            let output = json!({
                "nodeType": request.node.kind.as_str(),
                "node_id": request.node.id,
                "execution_index": request.execution_index,
                "parents": parents,
                "context": request.input.context.keys().collect::<Vec<_>>(),
                "remote": request.remote,
            });
            Ok(ComputeOutput::new(output).with_routing(routing))
        })
    }
}
