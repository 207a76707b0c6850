use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};
use crate::types::ProviderKind;

/// A graph of work units, immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub guardrails: Guardrails,
}

/// Per-graph upper bounds. Unset fields fall back to the scheduler config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Guardrails {
    #[serde(default)]
    pub max_node_executions: Option<u32>,
    #[serde(default)]
    pub max_runtime_secs: Option<u64>,
    #[serde(default)]
    pub max_parallelism: Option<usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    Start,
    End,
    Task,
    Decision,
    SubGraph,
    Plan,
    Milestone,
    Memory,
    Retrieval,
    ExternalAgentTask,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Task => "task",
            Self::Decision => "decision",
            Self::SubGraph => "subGraph",
            Self::Plan => "plan",
            Self::Milestone => "milestone",
            Self::Memory => "memory",
            Self::Retrieval => "retrieval",
            Self::ExternalAgentTask => "externalAgentTask",
        }
    }

    /// Structural nodes carry no remote work and always run in-process.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::Start | Self::End)
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node as authored: its config is an untyped key/value map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub ref_id: Option<String>,
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            ref_id: None,
            config: serde_json::Map::new(),
        }
    }

    pub fn with_ref(mut self, ref_id: impl Into<String>) -> Self {
        self.ref_id = Some(ref_id.into());
        self
    }

    pub fn with_config(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EdgeMode {
    /// Blocking control flow: the target joins on every solid parent.
    #[default]
    Solid,
    /// Non-blocking context pull of the source's latest output.
    Dotted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub source_node_id: String,
    pub target_node_id: String,
    #[serde(default)]
    pub mode: EdgeMode,
    #[serde(default)]
    pub condition_key: Option<String>,
}

impl Edge {
    /// Create an unconditioned solid edge.
    pub fn solid(id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_node_id: from.into(),
            target_node_id: to.into(),
            mode: EdgeMode::Solid,
            condition_key: None,
        }
    }

    /// Create a solid edge taken only for a matching route key.
    pub fn conditioned(
        id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            condition_key: Some(key.into()),
            ..Self::solid(id, from, to)
        }
    }

    /// Create a dotted context edge.
    pub fn dotted(id: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            mode: EdgeMode::Dotted,
            ..Self::solid(id, from, to)
        }
    }

    pub fn is_solid(&self) -> bool {
        self.mode == EdgeMode::Solid
    }

    pub fn is_unconditioned(&self) -> bool {
        self.condition_key.as_deref().map_or(true, |k| k.trim().is_empty())
    }
}

/// Strongly-typed node configuration, decoded once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeSpec {
    Start,
    End,
    Task {
        instructions: Option<String>,
    },
    Decision {
        fallback_route: Option<String>,
    },
    SubGraph {
        graph_id: String,
    },
    Plan {
        plan_id: String,
    },
    Milestone {
        milestone_id: String,
    },
    Memory {
        namespace: String,
    },
    Retrieval {
        query: String,
        top_k: u32,
    },
    ExternalAgentTask {
        agent: String,
        instructions: Option<String>,
    },
}

/// Routing and resource overrides a node may declare.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeOverrides {
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// A node after config decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledNode {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub ref_id: Option<String>,
    pub spec: NodeSpec,
    #[serde(default)]
    pub overrides: NodeOverrides,
    /// The authored config, passed through to the compute callback.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
}

impl CompiledNode {
    pub fn compile(node: &Node) -> Result<Self> {
        let cfg = ConfigReader { node };
        let spec = match node.kind {
            NodeKind::Start => NodeSpec::Start,
            NodeKind::End => NodeSpec::End,
            NodeKind::Task => NodeSpec::Task {
                instructions: cfg.opt_str("instructions")?,
            },
            NodeKind::Decision => NodeSpec::Decision {
                fallback_route: cfg.opt_str("fallback_route")?,
            },
            NodeKind::SubGraph => NodeSpec::SubGraph {
                graph_id: cfg.req_str("graph_id")?,
            },
            NodeKind::Plan => NodeSpec::Plan {
                plan_id: cfg.req_ref("plan")?,
            },
            NodeKind::Milestone => NodeSpec::Milestone {
                milestone_id: cfg.req_ref("milestone")?,
            },
            NodeKind::Memory => NodeSpec::Memory {
                namespace: cfg.opt_str("namespace")?.unwrap_or_else(|| "default".to_string()),
            },
            NodeKind::Retrieval => NodeSpec::Retrieval {
                query: cfg.req_str("query")?,
                top_k: cfg.opt_u32("top_k")?.unwrap_or(5),
            },
            NodeKind::ExternalAgentTask => NodeSpec::ExternalAgentTask {
                agent: cfg.req_str("agent")?,
                instructions: cfg.opt_str("instructions")?,
            },
        };

        let provider = cfg
            .opt_str("provider")?
            .map(|p| {
                p.parse::<ProviderKind>().map_err(|e| WeftError::InvalidNodeConfig {
                    node_id: node.id.clone(),
                    message: e.to_string(),
                })
            })
            .transpose()?;

        Ok(Self {
            id: node.id.clone(),
            kind: node.kind,
            ref_id: node.ref_id.clone(),
            spec,
            overrides: NodeOverrides {
                provider,
                image: cfg.opt_str("image")?,
                timeout_secs: cfg.opt_u64("timeout_secs")?,
            },
            config: node.config.clone(),
        })
    }
}

struct ConfigReader<'a> {
    node: &'a Node,
}

impl ConfigReader<'_> {
    fn invalid(&self, message: String) -> WeftError {
        WeftError::InvalidNodeConfig {
            node_id: self.node.id.clone(),
            message,
        }
    }

    fn opt_str(&self, key: &str) -> Result<Option<String>> {
        match self.node.config.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.invalid(format!("`{}` must be a string, got {}", key, other))),
        }
    }

    fn req_str(&self, key: &str) -> Result<String> {
        match self.opt_str(key)? {
            Some(s) if !s.trim().is_empty() => Ok(s),
            _ => Err(self.invalid(format!("missing required key `{}`", key))),
        }
    }

    fn opt_u64(&self, key: &str) -> Result<Option<u64>> {
        match self.node.config.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.invalid(format!("`{}` must be a non-negative integer", key))),
        }
    }

    fn opt_u32(&self, key: &str) -> Result<Option<u32>> {
        self.opt_u64(key)?
            .map(|v| u32::try_from(v).map_err(|_| self.invalid(format!("`{}` is out of range", key))))
            .transpose()
    }

    fn req_ref(&self, what: &str) -> Result<String> {
        match self.node.ref_id.as_deref() {
            Some(r) if !r.trim().is_empty() => Ok(r.to_string()),
            _ => Err(WeftError::UnresolvedReference {
                node_id: self.node.id.clone(),
                reference: format!("{} node requires a refId", what),
            }),
        }
    }
}

/// A validated graph with typed nodes.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    pub id: String,
    pub guardrails: Guardrails,
    pub nodes: Vec<CompiledNode>,
    pub edges: Vec<Edge>,
    pub start_node_id: String,
    index: HashMap<String, usize>,
}

impl CompiledGraph {
    /// Validate structure and decode every node's config.
    pub fn compile(graph: &Graph) -> Result<Self> {
        let starts: Vec<&Node> = graph
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Start)
            .collect();
        if starts.len() != 1 {
            return Err(WeftError::GraphDefinition(format!(
                "graph {} must have exactly one start node, found {}",
                graph.id,
                starts.len()
            )));
        }
        let start_node_id = starts[0].id.clone();

        let mut index = HashMap::new();
        let mut nodes = Vec::with_capacity(graph.nodes.len());
        for node in &graph.nodes {
            if index.insert(node.id.clone(), nodes.len()).is_some() {
                return Err(WeftError::GraphDefinition(format!(
                    "duplicate node id: {}",
                    node.id
                )));
            }
            nodes.push(CompiledNode::compile(node)?);
        }

        let mut edge_ids = HashSet::new();
        for edge in &graph.edges {
            if !edge_ids.insert(edge.id.as_str()) {
                return Err(WeftError::GraphDefinition(format!(
                    "duplicate edge id: {}",
                    edge.id
                )));
            }
            for endpoint in [&edge.source_node_id, &edge.target_node_id] {
                if !index.contains_key(endpoint) {
                    return Err(WeftError::GraphDefinition(format!(
                        "edge {} references unknown node {}",
                        edge.id, endpoint
                    )));
                }
            }
            if edge.mode == EdgeMode::Dotted && edge.target_node_id == start_node_id {
                return Err(WeftError::GraphDefinition(format!(
                    "dotted edge {} cannot target the start node",
                    edge.id
                )));
            }
        }

        Ok(Self {
            id: graph.id.clone(),
            guardrails: graph.guardrails.clone(),
            nodes,
            edges: graph.edges.clone(),
            start_node_id,
            index,
        })
    }

    pub fn node(&self, id: &str) -> Option<&CompiledNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }
}
